//! Queue envelope decoding.
//!
//! A queue message body wraps one or more queue records, each of whose `body`
//! is itself a JSON-serialized storage notification:
//!
//! ```text
//! {"Records":[{"body":"{\"Records\":[{\"s3\":{\"bucket\":{\"name\":\"b\"},\"object\":{\"key\":\"k\"}}}]}"}]}
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::event::ImageEvent;

/// Event name the storage service uses for its configuration probe message.
const TEST_EVENT: &str = "s3:TestEvent";

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Records")]
    records: Vec<EnvelopeRecord>,
}

#[derive(Deserialize)]
struct EnvelopeRecord {
    body: String,
}

#[derive(Deserialize)]
struct StorageNotification {
    #[serde(rename = "Records")]
    records: Option<Vec<StorageRecord>>,
    #[serde(rename = "Event")]
    event: Option<String>,
}

#[derive(Deserialize)]
struct StorageRecord {
    #[serde(rename = "eventTime")]
    event_time: Option<DateTime<Utc>>,
    s3: StorageEntity,
}

#[derive(Deserialize)]
struct StorageEntity {
    bucket: StorageBucket,
    object: StorageObject,
}

#[derive(Deserialize)]
struct StorageBucket {
    name: String,
}

#[derive(Deserialize)]
struct StorageObject {
    key: String,
}

/// Parses raw queue message bodies into [`ImageEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationDecoder {
    fan_out: bool,
}

impl NotificationDecoder {
    /// `fan_out` selects whether [`decode_message`](Self::decode_message)
    /// yields every inner record or only the first one.
    pub fn new(fan_out: bool) -> Self {
        Self { fan_out }
    }

    /// Decode the first inner record of the first queue record.
    pub fn decode(&self, raw: &str) -> Result<ImageEvent, DecodeError> {
        let envelope = parse_envelope(raw)?;
        let first = envelope.records.first().ok_or(DecodeError::Empty)?;
        let mut events = decode_body(&first.body)?;
        // decode_body never returns an empty vec
        Ok(events.swap_remove(0))
    }

    /// Decode every inner record of every queue record, in order.
    pub fn decode_all(&self, raw: &str) -> Result<Vec<ImageEvent>, DecodeError> {
        let envelope = parse_envelope(raw)?;
        let mut events = Vec::new();
        for record in &envelope.records {
            match decode_body(&record.body) {
                Ok(mut decoded) => events.append(&mut decoded),
                Err(DecodeError::Empty) => continue,
                Err(e) => return Err(e),
            }
        }
        if events.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(events)
    }

    /// Decode according to the configured fan-out mode.
    pub fn decode_message(&self, raw: &str) -> Result<Vec<ImageEvent>, DecodeError> {
        if self.fan_out {
            self.decode_all(raw)
        } else {
            self.decode(raw).map(|event| vec![event])
        }
    }
}

fn parse_envelope(raw: &str) -> Result<Envelope, DecodeError> {
    serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(format!("envelope: {}", e)))
}

/// Decode one storage notification body. Every inner record is validated
/// even when only the first is used, so a mixed-shape body fails closed.
fn decode_body(body: &str) -> Result<Vec<ImageEvent>, DecodeError> {
    let notification: StorageNotification = serde_json::from_str(body)
        .map_err(|e| DecodeError::Malformed(format!("notification: {}", e)))?;

    let records = match notification.records {
        Some(records) => records,
        None if notification.event.as_deref() == Some(TEST_EVENT) => return Err(DecodeError::Empty),
        None => {
            return Err(DecodeError::Malformed(
                "notification has no Records field".to_string(),
            ))
        }
    };

    if records.is_empty() {
        return Err(DecodeError::Empty);
    }

    let now = Utc::now();
    records
        .into_iter()
        .map(|record| {
            let bucket = record.s3.bucket.name;
            if bucket.is_empty() {
                return Err(DecodeError::Malformed("empty bucket name".to_string()));
            }
            let key = unescape_key(&record.s3.object.key)?;
            Ok(ImageEvent::new(bucket, key, record.event_time.unwrap_or(now)))
        })
        .collect()
}

/// Undo the form-style URL encoding storage notifications apply to keys
/// (`+` for space, `%3A` for `:` and so on).
pub fn unescape_key(raw: &str) -> Result<String, DecodeError> {
    let spaced = raw.replace('+', " ");
    let key = urlencoding::decode(&spaced)
        .map_err(|e| DecodeError::Malformed(format!("object key is not valid UTF-8: {}", e)))?
        .into_owned();
    if key.is_empty() {
        return Err(DecodeError::Malformed("empty object key".to_string()));
    }
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Nothing to process (e.g. a storage configuration test message).
    #[error("Envelope contains no storage records")]
    Empty,

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(bodies: &[serde_json::Value]) -> String {
        let records: Vec<_> = bodies
            .iter()
            .map(|b| serde_json::json!({ "body": b.to_string() }))
            .collect();
        serde_json::json!({ "Records": records }).to_string()
    }

    fn notification(pairs: &[(&str, &str)]) -> serde_json::Value {
        let records: Vec<_> = pairs
            .iter()
            .map(|(bucket, key)| {
                serde_json::json!({
                    "eventTime": "2024-03-01T12:00:00.000Z",
                    "s3": { "bucket": { "name": bucket }, "object": { "key": key } }
                })
            })
            .collect();
        serde_json::json!({ "Records": records })
    }

    #[test]
    fn test_decode_restores_colons() {
        let raw = r#"{"Records":[{"body":"{\"Records\":[{\"s3\":{\"bucket\":{\"name\":\"img-bucket\"},\"object\":{\"key\":\"private%3Auser1%3Aphoto.jpg\"}}}]}"}]}"#;
        let event = NotificationDecoder::default().decode(raw).unwrap();
        assert_eq!(event.bucket(), "img-bucket");
        assert_eq!(event.key(), "private:user1:photo.jpg");
    }

    #[test]
    fn test_decode_uses_event_time() {
        let raw = envelope(&[notification(&[("b", "a.png")])]);
        let event = NotificationDecoder::default().decode(&raw).unwrap();
        assert_eq!(event.received_at().to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_empty_inner_records() {
        let raw = envelope(&[serde_json::json!({ "Records": [] })]);
        assert_eq!(NotificationDecoder::default().decode(&raw), Err(DecodeError::Empty));
    }

    #[test]
    fn test_empty_outer_records() {
        let raw = r#"{"Records":[]}"#;
        assert_eq!(NotificationDecoder::default().decode(raw), Err(DecodeError::Empty));
        assert_eq!(NotificationDecoder::new(true).decode_all(raw), Err(DecodeError::Empty));
    }

    #[test]
    fn test_storage_test_event_is_empty() {
        let raw = envelope(&[serde_json::json!({
            "Service": "Amazon S3",
            "Event": "s3:TestEvent",
            "Bucket": "img-bucket"
        })]);
        assert_eq!(NotificationDecoder::default().decode(&raw), Err(DecodeError::Empty));
    }

    #[test]
    fn test_non_json_is_malformed_deterministically() {
        let decoder = NotificationDecoder::default();
        for _ in 0..3 {
            assert!(matches!(decoder.decode("not json"), Err(DecodeError::Malformed(_))));
        }
        assert!(matches!(decoder.decode("[1,2,3]"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decoder.decode("null"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let raw = envelope(&[serde_json::json!({
            "Records": [{ "s3": { "bucket": { "name": "b" } } }]
        })]);
        assert!(matches!(
            NotificationDecoder::default().decode(&raw),
            Err(DecodeError::Malformed(_))
        ));

        let body_not_string = r#"{"Records":[{"body":42}]}"#;
        assert!(matches!(
            NotificationDecoder::default().decode(body_not_string),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_inconsistent_inner_records_are_malformed() {
        let raw = envelope(&[serde_json::json!({
            "Records": [
                { "s3": { "bucket": { "name": "b" }, "object": { "key": "one.jpg" } } },
                { "s3": { "bucket": "b" } }
            ]
        })]);
        assert!(matches!(
            NotificationDecoder::default().decode(&raw),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_first_record_only() {
        let raw = envelope(&[notification(&[("b", "one.jpg"), ("b", "two.jpg")])]);
        let events = NotificationDecoder::new(false).decode_message(&raw).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key(), "one.jpg");
    }

    #[test]
    fn test_fan_out_all_records() {
        let raw = envelope(&[
            notification(&[("b", "one.jpg"), ("b", "two.jpg")]),
            serde_json::json!({ "Records": [] }),
            notification(&[("c", "three.jpg")]),
        ]);
        let events = NotificationDecoder::new(true).decode_message(&raw).unwrap();
        let keys: Vec<_> = events.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec!["one.jpg", "two.jpg", "three.jpg"]);
        assert_eq!(events[2].bucket(), "c");
    }

    #[test]
    fn test_unescape_key() {
        assert_eq!(unescape_key("a%3Ab%3Ac").unwrap(), "a:b:c");
        assert_eq!(unescape_key("my+photo%2B1.jpg").unwrap(), "my photo+1.jpg");
        assert!(matches!(unescape_key(""), Err(DecodeError::Malformed(_))));
        assert!(matches!(unescape_key("%FF%FE"), Err(DecodeError::Malformed(_))));
    }
}
