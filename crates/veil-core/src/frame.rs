//! Logical frames and the reply-topic convention.
//!
//! A frame is what an envelope carries once opened:
//!
//! ```text
//! {"t": <logical topic>, "p": <payload>, "c": <sender id>}
//! ```
//!
//! The logical topic only exists inside the frame; on the broker every frame
//! travels on [`CIPHERTEXT_CHANNEL`](crate::CIPHERTEXT_CHANNEL).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use veil_common::ids::{is_lower_hex, random_hex};

use crate::{REPLY_PREFIX, REPLY_TOPIC_HEX_LEN, REPLY_TO_KEY};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// The `(topic, payload, sender)` tuple carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "t")]
    pub topic: String,
    #[serde(rename = "p", default)]
    pub payload: Value,
    #[serde(rename = "c", default)]
    pub sender_id: String,
    /// Set by the receiving session when the frame arrived in a secure envelope.
    #[serde(skip)]
    pub sealed: bool,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: Value, sender_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            sender_id: sender_id.into(),
            sealed: false,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reply topic requested by the sender, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.payload.get(REPLY_TO_KEY).and_then(Value::as_str)
    }

    /// Whether this frame is itself a reply to some request.
    pub fn is_reply(&self) -> bool {
        is_reply_topic(&self.topic)
    }
}

/// A fresh single-use reply topic: prefix followed by 64 lowercase hex characters.
pub fn new_reply_topic() -> String {
    format!("{}{}", REPLY_PREFIX, random_hex(REPLY_TOPIC_HEX_LEN))
}

/// Whether `topic` follows the reply-topic convention.
pub fn is_reply_topic(topic: &str) -> bool {
    topic
        .strip_prefix(REPLY_PREFIX)
        .map(|id| id.len() == REPLY_TOPIC_HEX_LEN && is_lower_hex(id))
        .unwrap_or(false)
}
