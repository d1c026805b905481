use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::event::ImageEvent;
use crate::services::decoder::{DecodeError, NotificationDecoder};

/// Per-message acknowledgment decision reported back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Done (or nothing to do): delete the message.
    Ack,
    /// Transient failure: leave the message for redelivery.
    Retry,
    /// Permanent failure: route to the dead-letter queue.
    DeadLetter,
}

impl Outcome {
    /// Combine outcomes of several events carried by one message.
    ///
    /// `Retry` dominates so retryable work is not lost to a sibling's
    /// permanent failure; reprocessing is safe because label saves are upserts.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Retry, _) | (_, Outcome::Retry) => Outcome::Retry,
            (Outcome::DeadLetter, _) | (_, Outcome::DeadLetter) => Outcome::DeadLetter,
            _ => Outcome::Ack,
        }
    }
}

/// One raw message of a delivered batch, alive for a single attempt.
#[derive(Debug)]
pub struct BatchRecord {
    pub index: usize,
    pub decoded: Result<Vec<ImageEvent>, DecodeError>,
    /// Leading part of a malformed raw body.
    pub body_preview: Option<String>,
    pub outcome: Option<Outcome>,
}

impl BatchRecord {
    pub fn new(index: usize, decoded: Result<Vec<ImageEvent>, DecodeError>) -> Self {
        Self {
            index,
            decoded,
            body_preview: None,
            outcome: None,
        }
    }

    /// Decode `raw`, keeping a bounded prefix of it when it is malformed.
    pub fn decode(index: usize, raw: &str, decoder: &NotificationDecoder) -> Self {
        let mut record = Self::new(index, decoder.decode_message(raw));
        if matches!(record.decoded, Err(DecodeError::Malformed(_))) {
            record.body_preview = Some(preview(raw, BODY_PREVIEW_CHARS));
        }
        record
    }
}

const BODY_PREVIEW_CHARS: usize = 256;

fn preview(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &raw[..end]),
        None => raw.to_string(),
    }
}
