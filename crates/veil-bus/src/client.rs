//! Endpoint client.
//!
//! Wraps a [`Correlator`] with the key-exchange handshake and the policy on
//! when a request may leave without encryption.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};
use veil_core::{Outcome, KEYSERVER_PREFIX};
use veil_crypto::PublicKey;

use crate::broker::Qos;
use crate::correlator::Correlator;
use crate::error::{BusError, Result};
use crate::keyserver::{set_public_key_topic, GET_PUBLIC_KEY, PUBLIC_KEY_FIELD};
use crate::registry::Reply;
use crate::session::Identity;

/// How long [`Client::request`] waits for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct Client {
    identity: Identity,
    correlator: Correlator,
    server_key: Option<String>,
    accepted: bool,
    insecure_allowed: bool,
    request_timeout: Duration,
    qos: Qos,
}

impl Client {
    /// Run the key-exchange handshake.
    ///
    /// Without a known `server_key` the server is first asked for its key over
    /// an insecure request. The client key is then registered with the server.
    /// Each handshake step waits at most `timeout`. A server that cannot be
    /// reached leaves the client without a key; requests are refused then.
    pub async fn connect(
        identity: Identity,
        correlator: Correlator,
        server_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut client = Self {
            identity,
            correlator,
            server_key: server_key.filter(|pem| PublicKey::looks_like_pem(pem)),
            accepted: false,
            insecure_allowed: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            qos: Qos::default(),
        };

        if client.server_key.is_none() {
            client.server_key = client.fetch_server_key(timeout).await?;
        }
        client.accepted = client.register_key(timeout).await?;
        if client.accepted {
            info!(id = %client.identity.id, "server accepted client key");
        } else {
            warn!(id = %client.identity.id, "server did not accept client key");
        }
        Ok(client)
    }

    async fn fetch_server_key(&self, timeout: Duration) -> Result<Option<String>> {
        let reply = self
            .correlator
            .onetime(&self.identity, GET_PUBLIC_KEY, json!({}), None, timeout, self.qos)
            .await?;
        match reply.outcome() {
            Some(Outcome {
                success: true,
                result: Value::String(pem),
            }) if PublicKey::looks_like_pem(&pem) => Ok(Some(pem)),
            _ => {
                warn!(timed_out = reply.is_timed_out(), "server did not provide a public key");
                Ok(None)
            }
        }
    }

    async fn register_key(&self, timeout: Duration) -> Result<bool> {
        let Some(server_key) = self.server_key.as_deref() else {
            return Ok(false);
        };
        let message = json!({ PUBLIC_KEY_FIELD: self.identity.public_pem()? });
        let reply = self
            .correlator
            .onetime(
                &self.identity,
                &set_public_key_topic(&self.identity.id),
                message,
                Some(server_key),
                timeout,
                self.qos,
            )
            .await?;
        Ok(matches!(reply.outcome(), Some(Outcome { success: true, .. })))
    }

    /// Permit requests to `keyserver/...` topics without a server key.
    pub fn allow_insecure(&mut self) {
        warn!("insecure requests enabled, messages may be sent in plain text");
        self.insecure_allowed = true;
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn server_key(&self) -> Option<&str> {
        self.server_key.as_deref()
    }

    /// Whether the server confirmed the client key.
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Send `message` to `topic`, waiting for the reply if asked to.
    pub async fn request(&self, topic: &str, message: Value, wait_for_response: bool) -> Result<Reply> {
        match &self.server_key {
            None if !self.insecure_allowed => {
                return Err(BusError::InsecureRefused(
                    "server public key unknown".into(),
                ));
            }
            None if !topic.starts_with(&format!("{}/", KEYSERVER_PREFIX)) => {
                return Err(BusError::InsecureRefused(format!(
                    "insecure requests are limited to {}/ topics",
                    KEYSERVER_PREFIX
                )));
            }
            Some(_) if !self.accepted => {
                return Err(BusError::InsecureRefused(
                    "server has not accepted the client key".into(),
                ));
            }
            _ => {}
        }

        let timeout = if wait_for_response {
            self.request_timeout
        } else {
            Duration::ZERO
        };
        self.correlator
            .onetime(
                &self.identity,
                topic,
                message,
                self.server_key.as_deref(),
                timeout,
                self.qos,
            )
            .await
    }
}
