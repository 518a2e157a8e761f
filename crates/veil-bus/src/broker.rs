//! Broker links.
//!
//! A [`Broker`] hands out [`BrokerLink`]s: a publisher plus the inbound byte
//! stream of the one channel the link subscribed to. Two implementations:
//! - [`MqttBroker`] talks MQTT 3.1.1 to an external broker
//! - [`MemoryBroker`] fans out in-process, for tests and embedded use

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veil_common::ids::{random_id, IdSize};

use crate::error::{BusError, Result};

/// Capacity of the inbound queue of each link.
const INBOUND_CAPACITY: usize = 256;

/// Per-channel backlog of the in-memory broker.
const MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// Largest MQTT packet accepted in either direction.
const MQTT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Prefix of broker client ids.
pub const CLIENT_ID_PREFIX: &str = "veil|";

/// Fresh broker client id: `veil|` followed by 16 hex characters.
pub fn new_client_id() -> String {
    random_id(IdSize::Mini, CLIENT_ID_PREFIX)
}

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = BusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(BusError::InvalidRequest(format!("invalid QoS level {}", other))),
        }
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Publishing half of a broker link.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes, qos: Qos) -> Result<()>;

    /// Close the link. Calling it more than once is a no-op.
    async fn disconnect(&self);
}

/// One live broker connection subscribed to one channel.
pub struct BrokerLink {
    pub outbound: Arc<dyn Outbound>,
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Something that can open broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect as `client_id` and subscribe to `channel`.
    ///
    /// Fails with [`BusError::ConnectionRefused`] when the broker is unavailable.
    async fn connect(&self, client_id: &str, channel: &str) -> Result<BrokerLink>;
}

// ============================================================================
// In-memory broker
// ============================================================================

struct MemoryInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    available: AtomicBool,
    connections: AtomicUsize,
}

impl MemoryInner {
    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Process-local broker. Every link, including the publisher's own, receives
/// each message published on its channel.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                channels: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Switch the broker on or off. While off, `connect` is refused.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of links that are currently connected.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, client_id: &str, channel: &str) -> Result<BrokerLink> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionRefused("in-memory broker is offline".into()));
        }

        let mut subscription = self.inner.sender(channel).subscribe();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let id = client_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    message = subscription.recv() => match message {
                        Ok(payload) => {
                            if inbound_tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(client = %id, skipped, "link lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(client = %id, "memory link closed");
        });

        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        debug!(client = %client_id, channel, "memory link connected");

        Ok(BrokerLink {
            outbound: Arc::new(MemoryOutbound {
                inner: self.inner.clone(),
                shutdown: Mutex::new(Some(shutdown_tx)),
                connected: AtomicBool::new(true),
            }),
            inbound: inbound_rx,
        })
    }
}

struct MemoryOutbound {
    inner: Arc<MemoryInner>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    connected: AtomicBool,
}

impl MemoryOutbound {
    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.connections.fetch_sub(1, Ordering::SeqCst);
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
    }
}

#[async_trait]
impl Outbound for MemoryOutbound {
    async fn publish(&self, channel: &str, payload: Bytes, _qos: Qos) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        // No receivers is not an error: nobody is listening yet.
        let _ = self.inner.sender(channel).send(payload);
        Ok(())
    }

    async fn disconnect(&self) {
        self.close();
    }
}

impl Drop for MemoryOutbound {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// MQTT broker
// ============================================================================

/// External MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttBroker {
    host: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttBroker {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&self, client_id: &str, channel: &str) -> Result<BrokerLink> {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_max_packet_size(MQTT_MAX_PACKET_SIZE, MQTT_MAX_PACKET_SIZE);

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // Drive the event loop until the broker acknowledges the connection.
        let connack = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(format!("{:?}", code)),
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(e.to_string()),
                }
            }
        })
        .await;

        match connack {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(BusError::ConnectionRefused(format!(
                    "{}: {}",
                    self.address(),
                    reason
                )))
            }
            Err(_) => {
                return Err(BusError::ConnectionRefused(format!(
                    "{}: no CONNACK within {:?}",
                    self.address(),
                    self.connect_timeout
                )))
            }
        }

        client
            .subscribe(channel, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::ConnectionRefused(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let id = client_id.to_string();
        let pump = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if inbound_tx.send(publish.payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(client = %id, error = %e, "broker connection lost");
                        break;
                    }
                }
            }
            debug!(client = %id, "mqtt link closed");
        });

        info!(client = %client_id, broker = %self.address(), channel, "connected to broker");

        Ok(BrokerLink {
            outbound: Arc::new(MqttOutbound {
                client,
                pump: Mutex::new(Some(pump)),
                connected: AtomicBool::new(true),
            }),
            inbound: inbound_rx,
        })
    }
}

struct MqttOutbound {
    client: AsyncClient,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

#[async_trait]
impl Outbound for MqttOutbound {
    async fn publish(&self, channel: &str, payload: Bytes, qos: Qos) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        self.client
            .publish_bytes(channel, qos.into(), false, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        // Queued behind any pending publishes, so those are flushed first.
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered");
        }
        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(Duration::from_secs(1), &mut pump).await.is_err() {
                pump.abort();
            }
        }
    }
}

impl Drop for MqttOutbound {
    fn drop(&mut self) {
        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_format() {
        let id = new_client_id();
        assert!(id.starts_with(CLIENT_ID_PREFIX));
        assert_eq!(id.len(), CLIENT_ID_PREFIX.len() + 16);
        assert_ne!(id, new_client_id());
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(Qos::try_from(1).unwrap(), Qos::AtLeastOnce);
        assert!(Qos::try_from(3).is_err());
        assert_eq!(QoS::from(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_memory_fanout_includes_publisher() {
        let broker = MemoryBroker::new();
        let mut a = broker.connect("a", "chan").await.unwrap();
        let mut b = broker.connect("b", "chan").await.unwrap();
        let mut other = broker.connect("c", "elsewhere").await.unwrap();

        a.outbound
            .publish("chan", Bytes::from_static(b"hello"), Qos::AtMostOnce)
            .await
            .unwrap();

        assert_eq!(a.inbound.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.inbound.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(other.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_offline_refuses() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let result = broker.connect("a", "chan").await;
        assert!(matches!(result, Err(BusError::ConnectionRefused(_))));

        broker.set_available(true);
        assert!(broker.connect("a", "chan").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_connection_accounting() {
        let broker = MemoryBroker::new();
        let mut link = broker.connect("a", "chan").await.unwrap();
        let dropped = broker.connect("b", "chan").await.unwrap();
        assert_eq!(broker.connection_count(), 2);

        link.outbound.disconnect().await;
        link.outbound.disconnect().await;
        assert_eq!(broker.connection_count(), 1);

        // Inbound stream ends once the link is closed
        assert!(link.inbound.recv().await.is_none());

        let result = link
            .outbound
            .publish("chan", Bytes::from_static(b"x"), Qos::AtMostOnce)
            .await;
        assert!(matches!(result, Err(BusError::Disconnected)));

        drop(dropped);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_mqtt_unreachable_broker_is_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let broker = MqttBroker::new("127.0.0.1", port).with_connect_timeout(Duration::from_secs(2));
        let result = broker.connect(&new_client_id(), "veil/encrypted").await;
        assert!(matches!(result, Err(BusError::ConnectionRefused(_))));
    }
}
