//! Core Veil protocol types and constants.
//!
//! This crate provides:
//! - The logical [`Frame`] carried inside every envelope
//! - The reply-topic convention used for request/reply correlation
//! - MQTT-style topic matching with wildcard capture
//! - The route [`Dispatcher`] that turns topics into handler calls

#![forbid(unsafe_code)]

pub mod dispatch;
pub mod frame;
pub mod topic;

pub use dispatch::{Dispatcher, DispatcherConfig, Outcome, Request, RouteOptions};
pub use frame::{is_reply_topic, new_reply_topic, Frame, FrameError};

/// The one broker-level topic all envelopes are published on.
pub const CIPHERTEXT_CHANNEL: &str = "veil/encrypted";

/// Prefix of single-use reply topics.
pub const REPLY_PREFIX: &str = "veil/tmp/";

/// Number of hex characters after [`REPLY_PREFIX`].
pub const REPLY_TOPIC_HEX_LEN: usize = 64;

/// Payload key naming the reply topic of a request.
pub const REPLY_TO_KEY: &str = "reply-to";

/// Topic prefix of the key-exchange handshake.
pub const KEYSERVER_PREFIX: &str = "keyserver";

/// Pattern exempt from signature enforcement: the handshake runs before keys are known.
pub const DEFAULT_EXEMPT_PATTERN: &str = "keyserver/#";

/// Pattern matching every topic.
pub const CATCH_ALL: &str = "#";

/// Message returned when no route matches.
pub const ENDPOINT_NOT_FOUND: &str = "Endpoint not found";
