//! Encrypted transport session.
//!
//! A session owns one broker link subscribed to the ciphertext channel. Every
//! outgoing frame is sealed into an envelope; every inbound envelope is opened,
//! checked against the signature policy and, if its logical topic matches a
//! local subscription, handed to the registered frame handler.
//!
//! Inbound handling runs on a dedicated task per session, so a caller waiting
//! on a reply never blocks the path that delivers it.
//!
//! # Signature policy
//!
//! | envelope                       | delivered?                              |
//! |--------------------------------|-----------------------------------------|
//! | signed by remote key           | yes                                     |
//! | insecure, session insecure     | yes                                     |
//! | insecure, session secure       | only if the topic matches the exemption |
//! | any other signer               | only if the topic matches the exemption |
//! | not for this key / own         | never (silently)                        |

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use veil_core::{topic, Frame, CIPHERTEXT_CHANNEL, DEFAULT_EXEMPT_PATTERN};
use veil_crypto::{KeyPair, SecureEnvelope, Unsealed};

use crate::broker::{new_client_id, Broker, Outbound, Qos};
use crate::error::{BusError, Result};

/// Callback receiving every delivered frame.
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// A peer's name on the bus together with its keypair.
#[derive(Clone)]
pub struct Identity {
    pub id: String,
    pub keys: Arc<KeyPair>,
}

impl Identity {
    pub fn new(id: impl Into<String>, keys: Arc<KeyPair>) -> Self {
        Self {
            id: id.into(),
            keys,
        }
    }

    pub fn public_pem(&self) -> Result<String> {
        Ok(self.keys.public_pem()?)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("key", &self.keys.public_key())
            .finish()
    }
}

/// Settings for [`TransportSession::connect`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub identity: Identity,
    /// Peer key. Without it the session runs in insecure mode.
    pub remote_public_key: Option<String>,
    /// Topics delivered even when their signature does not match.
    pub exempt_pattern: String,
    /// Fresh symmetric key before every send.
    pub rotate: bool,
    pub qos: Qos,
}

impl SessionOptions {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            remote_public_key: None,
            exempt_pattern: DEFAULT_EXEMPT_PATTERN.to_string(),
            rotate: true,
            qos: Qos::default(),
        }
    }

    pub fn with_remote_key(mut self, remote_public_key: Option<String>) -> Self {
        self.remote_public_key = remote_public_key;
        self
    }

    pub fn with_exempt_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exempt_pattern = pattern.into();
        self
    }

    pub fn with_rotation(mut self, rotate: bool) -> Self {
        self.rotate = rotate;
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }
}

/// State shared with the inbound task.
struct Shared {
    identity: Identity,
    envelope: RwLock<SecureEnvelope>,
    plain: RwLock<SecureEnvelope>,
    subscriptions: RwLock<Vec<String>>,
    handler: RwLock<Option<FrameHandler>>,
    exempt_pattern: String,
    rotate: bool,
}

impl Shared {
    fn handle(&self, payload: &[u8]) {
        let Ok(text) = std::str::from_utf8(payload) else {
            debug!("dropping non UTF-8 message");
            return;
        };

        let (unsealed, secure) = {
            let envelope = self.envelope.read().unwrap_or_else(PoisonError::into_inner);
            (envelope.classify(text), envelope.is_secure())
        };
        let (opened, trusted, sealed) = match unsealed {
            Unsealed::Decrypted(opened) => (opened, true, true),
            Unsealed::BadSignature(opened) => (opened, false, true),
            Unsealed::Plain(opened) => (opened, !secure, false),
            Unsealed::NotForMe => {
                trace!("envelope not addressed to this session");
                return;
            }
            Unsealed::OwnMessage => {
                trace!("own envelope echoed back");
                return;
            }
            Unsealed::Malformed(e) => {
                debug!(error = %e, "dropping malformed envelope");
                return;
            }
        };

        let mut frame = match Frame::from_json(&opened.plaintext) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping envelope without a valid frame");
                return;
            }
        };

        frame.sealed = sealed;

        if !trusted && !topic::matches(&self.exempt_pattern, &frame.topic) {
            if sealed {
                warn!(
                    topic = %frame.topic,
                    sender = %frame.sender_id,
                    "dropping frame with invalid signature"
                );
            } else {
                warn!(
                    topic = %frame.topic,
                    sender = %frame.sender_id,
                    "dropping unsigned frame on a secure session"
                );
            }
            return;
        }

        let subscribed = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|pattern| topic::matches(pattern, &frame.topic));
        if !subscribed {
            return;
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(frame),
            None => trace!(topic = %frame.topic, "no handler registered"),
        }
    }
}

/// One encrypted connection to the bus.
pub struct TransportSession {
    shared: Arc<Shared>,
    outbound: Arc<dyn Outbound>,
    listener: JoinHandle<()>,
    client_id: String,
    qos: Qos,
    disconnected: AtomicBool,
}

impl TransportSession {
    /// Connect to the broker and start listening on the ciphertext channel.
    pub async fn connect(broker: &dyn Broker, options: SessionOptions) -> Result<Self> {
        let SessionOptions {
            identity,
            remote_public_key,
            exempt_pattern,
            rotate,
            qos,
        } = options;

        let envelope = SecureEnvelope::new(
            identity.keys.clone(),
            remote_public_key.as_deref(),
            rotate,
        )?;
        let plain = SecureEnvelope::new(identity.keys.clone(), None, false)?;
        let secure = envelope.is_secure();

        let client_id = new_client_id();
        let link = broker.connect(&client_id, CIPHERTEXT_CHANNEL).await?;

        let shared = Arc::new(Shared {
            identity,
            envelope: RwLock::new(envelope),
            plain: RwLock::new(plain),
            subscriptions: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            exempt_pattern,
            rotate,
        });
        let listener = tokio::spawn(listen(shared.clone(), link.inbound));

        info!(
            id = %shared.identity.id,
            client = %client_id,
            secure,
            "transport session connected"
        );

        Ok(Self {
            shared,
            outbound: link.outbound,
            listener,
            client_id,
            qos,
            disconnected: AtomicBool::new(false),
        })
    }

    /// Register the callback for delivered frames, replacing any earlier one.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Deliver frames whose topic matches `pattern`. Purely local.
    pub fn subscribe(&self, pattern: &str) {
        let mut subscriptions = self
            .shared
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscriptions.iter().any(|p| p == pattern) {
            debug!(pattern, "subscribed");
            subscriptions.push(pattern.to_string());
        }
    }

    /// Seal `{t, p, c}` and publish it on the ciphertext channel.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.send(topic, payload, false).await
    }

    /// Publish in an insecure envelope even when a remote key is set.
    ///
    /// Used to answer peers that sent in the clear: they hold no server key
    /// and could not open a sealed reply.
    pub async fn publish_plain(&self, topic: &str, payload: Value) -> Result<()> {
        self.send(topic, payload, true).await
    }

    async fn send(&self, topic: &str, payload: Value, plain: bool) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        let frame = Frame::new(topic, payload, self.shared.identity.id.as_str());
        let sealed = {
            let lock = if plain {
                &self.shared.plain
            } else {
                &self.shared.envelope
            };
            let mut envelope = lock.write().unwrap_or_else(PoisonError::into_inner);
            envelope.encrypt(&frame)?
        };
        trace!(topic, plain, "publishing frame");
        self.outbound
            .publish(CIPHERTEXT_CHANNEL, Bytes::from(sealed), self.qos)
            .await
    }

    /// Replace the remote key. The envelope is rebuilt, so symmetric state resets.
    pub fn update_remote_key(&self, remote_public_key: Option<&str>) -> Result<()> {
        let envelope = SecureEnvelope::new(
            self.shared.identity.keys.clone(),
            remote_public_key,
            self.shared.rotate,
        )?;
        let secure = envelope.is_secure();
        *self
            .shared
            .envelope
            .write()
            .unwrap_or_else(PoisonError::into_inner) = envelope;
        info!(id = %self.shared.identity.id, secure, "remote key updated");
        Ok(())
    }

    /// Release the broker connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.abort();
        self.outbound.disconnect().await;
        debug!(client = %self.client_id, "transport session disconnected");
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_secure(&self) -> bool {
        self.shared
            .envelope
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_secure()
    }

    /// Logical sender id written into every frame.
    pub fn id(&self) -> &str {
        &self.shared.identity.id
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Broker-level client id of this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn exempt_pattern(&self) -> &str {
        &self.shared.exempt_pattern
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id())
            .field("client_id", &self.client_id)
            .field("secure", &self.is_secure())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn listen(shared: Arc<Shared>, mut inbound: mpsc::Receiver<Bytes>) {
    while let Some(payload) = inbound.recv().await {
        shared.handle(&payload);
    }
    debug!(id = %shared.identity.id, "inbound stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::test_support::{identity, KEY_A, KEY_B, KEY_C};
    use serde_json::json;
    use std::time::Duration;

    fn collector(session: &TransportSession, pattern: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.subscribe(pattern);
        session.on_message(move |frame| {
            let _ = tx.send(frame);
        });
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn pair(broker: &MemoryBroker) -> (TransportSession, TransportSession) {
        let a = identity("a", KEY_A);
        let b = identity("b", KEY_B);
        let a_pem = a.public_pem().unwrap();
        let b_pem = b.public_pem().unwrap();
        let sa = TransportSession::connect(broker, SessionOptions::new(a).with_remote_key(Some(b_pem)))
            .await
            .unwrap();
        let sb = TransportSession::connect(broker, SessionOptions::new(b).with_remote_key(Some(a_pem)))
            .await
            .unwrap();
        (sa, sb)
    }

    #[tokio::test]
    async fn test_secure_publish_is_delivered() {
        let broker = MemoryBroker::new();
        let (sa, sb) = pair(&broker).await;
        assert!(sa.is_secure() && sb.is_secure());

        let mut inbox = collector(&sb, "client/+/ping");
        sa.publish("client/42/ping", json!({"n": 1})).await.unwrap();

        let frame = next(&mut inbox).await.unwrap();
        assert_eq!(frame.topic, "client/42/ping");
        assert_eq!(frame.payload, json!({"n": 1}));
        assert_eq!(frame.sender_id, "a");
    }

    #[tokio::test]
    async fn test_unsubscribed_topics_are_not_delivered() {
        let broker = MemoryBroker::new();
        let (sa, sb) = pair(&broker).await;
        let mut inbox = collector(&sb, "wanted");

        sa.publish("unwanted", json!(1)).await.unwrap();
        sa.publish("wanted", json!(2)).await.unwrap();

        assert_eq!(next(&mut inbox).await.unwrap().payload, json!(2));
    }

    #[tokio::test]
    async fn test_own_secure_frames_are_not_delivered() {
        let broker = MemoryBroker::new();
        let (sa, _sb) = pair(&broker).await;
        let mut inbox = collector(&sa, "#");

        sa.publish("echo", json!(1)).await.unwrap();
        assert!(next(&mut inbox).await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_signer_dropped_unless_exempt() {
        let broker = MemoryBroker::new();
        let (_sa, sb) = pair(&broker).await;
        let mut inbox = collector(&sb, "#");

        // Carol encrypts for Bob, who only trusts Alice
        let b_pem = identity("b", KEY_B).public_pem().unwrap();
        let carol = TransportSession::connect(
            &broker,
            SessionOptions::new(identity("c", KEY_C)).with_remote_key(Some(b_pem)),
        )
        .await
        .unwrap();

        carol.publish("ping", json!("forged")).await.unwrap();
        carol
            .publish("keyserver/client/c/set/public-key", json!("handshake"))
            .await
            .unwrap();

        let frame = next(&mut inbox).await.unwrap();
        assert_eq!(frame.topic, "keyserver/client/c/set/public-key");
        assert!(next(&mut inbox).await.is_none());
    }

    #[tokio::test]
    async fn test_paired_session_drops_unsigned_frames_unless_exempt() {
        let broker = MemoryBroker::new();
        let (_sa, sb) = pair(&broker).await;
        let mut inbox = collector(&sb, "#");

        // Carol sends without any key, so her envelopes are insecure
        let carol = TransportSession::connect(&broker, SessionOptions::new(identity("c", KEY_C)))
            .await
            .unwrap();
        carol.publish("admin/wipe", json!({"all": true})).await.unwrap();
        carol
            .publish("keyserver/server/get/public-key", json!({}))
            .await
            .unwrap();

        let frame = next(&mut inbox).await.unwrap();
        assert_eq!(frame.topic, "keyserver/server/get/public-key");
        assert!(!frame.sealed);
        assert!(next(&mut inbox).await.is_none());
    }

    #[tokio::test]
    async fn test_delivered_frames_record_sealing() {
        let broker = MemoryBroker::new();
        let (sa, sb) = pair(&broker).await;
        let mut inbox = collector(&sb, "#");

        sa.publish("ping", json!(1)).await.unwrap();
        assert!(next(&mut inbox).await.unwrap().sealed);
    }

    #[tokio::test]
    async fn test_insecure_sessions_exchange_plain_frames() {
        let broker = MemoryBroker::new();
        let a = TransportSession::connect(&broker, SessionOptions::new(identity("a", KEY_A)))
            .await
            .unwrap();
        let b = TransportSession::connect(&broker, SessionOptions::new(identity("b", KEY_B)))
            .await
            .unwrap();
        assert!(!a.is_secure());

        let mut inbox = collector(&b, "#");
        a.publish("hello", json!({"x": true})).await.unwrap();
        assert_eq!(next(&mut inbox).await.unwrap().payload, json!({"x": true}));
    }

    #[tokio::test]
    async fn test_publish_plain_is_readable_by_unpaired_peer() {
        let broker = MemoryBroker::new();
        let (sa, _sb) = pair(&broker).await;
        let stranger = TransportSession::connect(&broker, SessionOptions::new(identity("c", KEY_C)))
            .await
            .unwrap();
        let mut inbox = collector(&stranger, "#");

        sa.publish("secret", json!(1)).await.unwrap();
        sa.publish_plain("keyserver/server/get/public-key", json!("pem")).await.unwrap();

        let frame = next(&mut inbox).await.unwrap();
        assert_eq!(frame.topic, "keyserver/server/get/public-key");
        assert!(next(&mut inbox).await.is_none());
    }

    #[tokio::test]
    async fn test_update_remote_key_switches_mode() {
        let broker = MemoryBroker::new();
        let a = identity("a", KEY_A);
        let session = TransportSession::connect(&broker, SessionOptions::new(a)).await.unwrap();
        assert!(!session.is_secure());

        let pem = identity("b", KEY_B).public_pem().unwrap();
        session.update_remote_key(Some(&pem)).unwrap();
        assert!(session.is_secure());

        session.update_remote_key(None).unwrap();
        assert!(!session.is_secure());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let session = TransportSession::connect(&broker, SessionOptions::new(identity("a", KEY_A)))
            .await
            .unwrap();
        assert_eq!(broker.connection_count(), 1);

        session.disconnect().await;
        session.disconnect().await;
        assert!(!session.is_connected());
        assert_eq!(broker.connection_count(), 0);

        let result = session.publish("x", json!(null)).await;
        assert!(matches!(result, Err(BusError::Disconnected)));
    }

    #[tokio::test]
    async fn test_dropping_session_releases_connection() {
        let broker = MemoryBroker::new();
        let session = TransportSession::connect(&broker, SessionOptions::new(identity("a", KEY_A)))
            .await
            .unwrap();
        drop(session);
        assert_eq!(broker.connection_count(), 0);
    }
}
