//! Pending reply registry.
//!
//! Maps single-use reply topics to the waiter that expects them. The inbound
//! side calls [`PendingReplies::resolve`]; the waiting side holds a
//! [`ReplyTicket`] and awaits it. Each ticket is woken exactly once through a
//! oneshot channel, bounded by its timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use veil_core::{new_reply_topic, Outcome};

/// What a request/reply exchange produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The correlated reply payload.
    Value(Value),
    /// Nothing arrived before the timeout.
    TimedOut,
    /// Fire-and-forget: no reply was requested.
    Detached,
}

impl Reply {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Reply::TimedOut)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Reply::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Reply::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Interpret the reply as an endpoint outcome (`{"success", "result"}`).
    pub fn outcome(&self) -> Option<Outcome> {
        self.value()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Shared table of reply topics awaiting an answer.
#[derive(Clone, Default)]
pub struct PendingReplies {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh reply topic and start waiting on it.
    pub fn register(&self, timeout: Duration) -> ReplyTicket {
        let reply_topic = new_reply_topic();
        let created_at = Instant::now();
        let (sender, receiver) = oneshot::channel();
        self.entries().insert(reply_topic.clone(), sender);
        trace!(topic = %reply_topic, ?timeout, "reply ticket registered");
        ReplyTicket {
            reply_topic,
            created_at,
            timeout,
            receiver,
            registry: self.clone(),
        }
    }

    /// Hand `value` to the waiter of `reply_topic`.
    ///
    /// Returns `false` if nobody is waiting (unknown, expired or already resolved).
    pub fn resolve(&self, reply_topic: &str, value: Value) -> bool {
        let pending = self.entries().remove(reply_topic);
        match pending {
            Some(sender) => sender.send(value).is_ok(),
            None => {
                trace!(topic = %reply_topic, "reply for unknown ticket");
                false
            }
        }
    }

    /// Stop waiting on `reply_topic`. Returns whether it was pending.
    pub fn cancel(&self, reply_topic: &str) -> bool {
        self.entries().remove(reply_topic).is_some()
    }

    pub fn contains(&self, reply_topic: &str) -> bool {
        self.entries().contains_key(reply_topic)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl std::fmt::Debug for PendingReplies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReplies")
            .field("pending", &self.len())
            .finish()
    }
}

/// One registered reply topic. Dropping the ticket unregisters it.
#[derive(Debug)]
pub struct ReplyTicket {
    reply_topic: String,
    created_at: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Value>,
    registry: PendingReplies,
}

impl ReplyTicket {
    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Wait for the reply, at most until the ticket's timeout.
    pub async fn wait(mut self) -> Reply {
        let remaining = self.timeout.saturating_sub(self.created_at.elapsed());
        match tokio::time::timeout(remaining, &mut self.receiver).await {
            Ok(Ok(value)) => Reply::Value(value),
            // Sender dropped: the ticket was cancelled
            Ok(Err(_)) => Reply::TimedOut,
            Err(_) => {
                self.registry.cancel(&self.reply_topic);
                // A reply may have landed between the timer firing and the cancel
                match self.receiver.try_recv() {
                    Ok(value) => Reply::Value(value),
                    Err(_) => {
                        debug!(topic = %self.reply_topic, "reply timed out");
                        Reply::TimedOut
                    }
                }
            }
        }
    }
}

impl Drop for ReplyTicket {
    fn drop(&mut self) {
        self.registry.cancel(&self.reply_topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_before_wait() {
        let registry = PendingReplies::new();
        let ticket = registry.register(Duration::from_secs(5));
        assert!(registry.contains(ticket.reply_topic()));

        assert!(registry.resolve(ticket.reply_topic(), json!({"success": true, "result": 1})));
        assert!(registry.is_empty());

        let reply = ticket.wait().await;
        assert_eq!(reply.outcome(), Some(Outcome::ok(json!(1))));
    }

    #[tokio::test]
    async fn test_resolve_while_waiting() {
        let registry = PendingReplies::new();
        let ticket = registry.register(Duration::from_secs(5));
        let topic = ticket.reply_topic().to_string();

        let resolver = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(&topic, json!("late but in time"));
        });

        assert_eq!(ticket.wait().await, Reply::Value(json!("late but in time")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_yields_sentinel() {
        let registry = PendingReplies::new();
        let ticket = registry.register(Duration::from_millis(50));
        let topic = ticket.reply_topic().to_string();

        let started = Instant::now();
        assert_eq!(ticket.wait().await, Reply::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Entry is gone; a late reply finds nobody
        assert!(!registry.contains(&topic));
        assert!(!registry.resolve(&topic, json!(1)));
    }

    #[tokio::test]
    async fn test_resolve_is_single_use() {
        let registry = PendingReplies::new();
        let ticket = registry.register(Duration::from_secs(1));
        let topic = ticket.reply_topic().to_string();

        assert!(registry.resolve(&topic, json!(1)));
        assert!(!registry.resolve(&topic, json!(2)));
        assert_eq!(ticket.wait().await, Reply::Value(json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_tickets_do_not_cross() {
        let registry = PendingReplies::new();
        let tickets: Vec<_> = (0..16)
            .map(|_| registry.register(Duration::from_secs(5)))
            .collect();
        for (i, ticket) in tickets.iter().enumerate() {
            registry.resolve(ticket.reply_topic(), json!(i));
        }
        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.wait().await, Reply::Value(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let registry = PendingReplies::new();
        let ticket = registry.register(Duration::from_secs(5));
        assert_eq!(registry.len(), 1);
        drop(ticket);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reply_accessors() {
        assert!(Reply::TimedOut.is_timed_out());
        assert_eq!(Reply::Detached.value(), None);
        assert_eq!(Reply::Value(json!(3)).into_value(), Some(json!(3)));
        assert_eq!(Reply::Value(json!("not an outcome")).outcome(), None);
    }
}
