//! Veil transport layer.
//!
//! This crate provides:
//! - Broker links ([`MqttBroker`] for real deployments, [`MemoryBroker`] in-process)
//! - [`TransportSession`]: one encrypted connection on the shared ciphertext channel
//! - [`Correlator`]: request/reply over pub/sub with single-use reply topics
//! - [`EndpointServer`] and [`Client`], including the public-key handshake
//!
//! # Flow
//!
//! A client request is sealed for the server and published on the ciphertext
//! channel together with a fresh reply topic. The server session opens it,
//! dispatches it to a route and publishes the outcome on the reply topic,
//! where the client's registry picks it up.

#![forbid(unsafe_code)]

pub mod broker;
pub mod client;
pub mod correlator;
pub mod error;
pub mod keyserver;
pub mod registry;
pub mod server;
pub mod session;

pub use broker::{Broker, BrokerLink, MemoryBroker, MqttBroker, Outbound, Qos};
pub use client::{Client, DEFAULT_REQUEST_TIMEOUT};
pub use correlator::Correlator;
pub use error::{BusError, Result};
pub use registry::{PendingReplies, Reply, ReplyTicket};
pub use server::EndpointServer;
pub use session::{FrameHandler, Identity, SessionOptions, TransportSession};
