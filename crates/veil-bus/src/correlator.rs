//! Request/reply over pub/sub.
//!
//! The broker has no notion of a reply, so each request travels with a
//! single-use reply topic under `reply-to`. [`Correlator::onetime`] opens an
//! ephemeral session for the exchange, waits on the registry for the reply and
//! always tears the session down afterwards.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use veil_core::{CATCH_ALL, REPLY_TO_KEY};

use crate::broker::{Broker, Qos};
use crate::error::{BusError, Result};
use crate::registry::{PendingReplies, Reply, ReplyTicket};
use crate::session::{Identity, SessionOptions, TransportSession};

/// Issues one-shot requests and correlates their replies.
#[derive(Clone)]
pub struct Correlator {
    broker: Arc<dyn Broker>,
    pending: PendingReplies,
}

impl Correlator {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_registry(broker, PendingReplies::new())
    }

    pub fn with_registry(broker: Arc<dyn Broker>, pending: PendingReplies) -> Self {
        Self { broker, pending }
    }

    pub fn pending(&self) -> &PendingReplies {
        &self.pending
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish `message` on `topic` and wait up to `timeout` for the reply.
    ///
    /// A zero `timeout` publishes and returns [`Reply::Detached`] without
    /// waiting. Expecting a reply requires `message` to be a JSON object, since
    /// the reply topic is attached to it. An elapsed timeout is not an error:
    /// it returns [`Reply::TimedOut`].
    pub async fn onetime(
        &self,
        identity: &Identity,
        topic: &str,
        message: Value,
        remote_public_key: Option<&str>,
        timeout: Duration,
        qos: Qos,
    ) -> Result<Reply> {
        let mut message = message;
        let ticket = if timeout.is_zero() {
            None
        } else {
            let Value::Object(fields) = &mut message else {
                return Err(BusError::InvalidRequest(
                    "a request expecting a reply must be a JSON object".into(),
                ));
            };
            let ticket = self.pending.register(timeout);
            fields.insert(
                REPLY_TO_KEY.to_string(),
                Value::String(ticket.reply_topic().to_string()),
            );
            Some(ticket)
        };

        let options = SessionOptions::new(identity.clone())
            .with_remote_key(remote_public_key.map(str::to_string))
            .with_qos(qos);
        let session = TransportSession::connect(self.broker.as_ref(), options).await?;

        let result = self.exchange(&session, topic, message, ticket).await;
        session.disconnect().await;
        result
    }

    async fn exchange(
        &self,
        session: &TransportSession,
        topic: &str,
        message: Value,
        ticket: Option<ReplyTicket>,
    ) -> Result<Reply> {
        let pending = self.pending.clone();
        session.subscribe(CATCH_ALL);
        session.on_message(move |frame| {
            if frame.is_reply() {
                pending.resolve(&frame.topic, frame.payload);
            }
        });

        session.publish(topic, message).await?;

        let Some(ticket) = ticket else {
            debug!(topic, "request sent without waiting");
            return Ok(Reply::Detached);
        };
        let reply = ticket.wait().await;
        debug!(topic, timed_out = reply.is_timed_out(), "request finished");
        Ok(reply)
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}
