//! Envelope and image fixtures for pipeline tests

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

pub const IMAGE_BUCKET: &str = "img-bucket";
pub const THUMBNAIL_BUCKET: &str = "img-bucket-resized";

/// The queue delivery from the original deployment, verbatim.
pub const ENCODED_KEY_ENVELOPE: &str = r#"{"Records":[{"body":"{\"Records\":[{\"s3\":{\"bucket\":{\"name\":\"img-bucket\"},\"object\":{\"key\":\"private%3Auser1%3Aphoto.jpg\"}}}]}"}]}"#;

/// Storage configuration probe, sent when notifications are first wired up.
pub const TEST_EVENT_ENVELOPE: &str = r#"{"Records":[{"body":"{\"Service\":\"Amazon S3\",\"Event\":\"s3:TestEvent\",\"Time\":\"2024-03-01T12:00:00.000Z\",\"Bucket\":\"img-bucket\"}"}]}"#;

/// Envelope wrapping one notification per key, all for `bucket`.
pub fn envelope(bucket: &str, keys: &[&str]) -> String {
    let records: Vec<_> = keys
        .iter()
        .map(|key| {
            serde_json::json!({
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "eventName": "ObjectCreated:Put",
                "eventTime": "2024-03-01T12:00:00.000Z",
                "s3": {
                    "bucket": { "name": bucket },
                    "object": { "key": key, "size": 1024 }
                }
            })
        })
        .collect();
    let body = serde_json::json!({ "Records": records });
    serde_json::json!({ "Records": [{ "body": body.to_string() }] }).to_string()
}

/// A small valid PNG.
pub fn png_image(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([20, 120, 220]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode png");
    out
}
