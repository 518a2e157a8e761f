//! Endpoint server.
//!
//! Exposes a [`Dispatcher`] on the bus: every route pattern becomes a session
//! subscription, every delivered frame is executed, and when the frame names a
//! reply topic the outcome is published there as `{"success", "result"}`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use veil_core::{Dispatcher, Frame, Request};

use crate::broker::Broker;
use crate::error::Result;
use crate::session::{SessionOptions, TransportSession};

/// Frames buffered between the inbound task and the executor.
const INBOX_CAPACITY: usize = 1024;

pub struct EndpointServer {
    session: Arc<TransportSession>,
    dispatcher: Dispatcher,
    inbox: mpsc::Receiver<Frame>,
}

impl EndpointServer {
    /// Connect a new session and serve `dispatcher` on it.
    pub async fn start(broker: &dyn Broker, options: SessionOptions, dispatcher: Dispatcher) -> Result<Self> {
        let session = Arc::new(TransportSession::connect(broker, options).await?);
        Ok(Self::with_session(session, dispatcher))
    }

    /// Serve `dispatcher` on an existing session.
    ///
    /// Routes must be registered before this call; each pattern is subscribed here.
    pub fn with_session(session: Arc<TransportSession>, dispatcher: Dispatcher) -> Self {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        for pattern in dispatcher.patterns() {
            session.subscribe(pattern);
        }
        session.on_message(move |frame| {
            if let Err(e) = tx.try_send(frame) {
                warn!(error = %e, "server inbox unavailable, dropping frame");
            }
        });
        info!(
            id = %session.id(),
            routes = dispatcher.len(),
            "endpoint server ready"
        );
        Self {
            session,
            dispatcher,
            inbox,
        }
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve until `shutdown` completes, then disconnect.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                frame = self.inbox.recv() => match frame {
                    Some(frame) => self.handle(frame).await,
                    None => break,
                },
            }
        }

        self.session.disconnect().await;
        info!(id = %self.session.id(), "endpoint server stopped");
        Ok(())
    }

    async fn handle(&self, frame: Frame) {
        // Replies to our own requests are never endpoints
        if frame.is_reply() {
            return;
        }

        let mut request = Request::new(frame.topic.as_str(), frame.payload.clone());
        if !frame.sender_id.is_empty() {
            request = request.with_sender(frame.sender_id.as_str());
        }
        let outcome = self.dispatcher.execute(&frame.topic, &request);
        debug!(topic = %frame.topic, success = outcome.success, "request executed");

        let Some(reply_to) = frame.reply_to() else {
            return;
        };
        // A peer that sent in the clear has no key to open a sealed reply
        let published = if !frame.sealed {
            self.session.publish_plain(reply_to, outcome.to_value()).await
        } else {
            self.session.publish(reply_to, outcome.to_value()).await
        };
        if let Err(e) = published {
            warn!(topic = %frame.topic, error = %e, "failed to publish reply");
        }
    }
}

impl std::fmt::Debug for EndpointServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointServer")
            .field("session", &self.session)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
