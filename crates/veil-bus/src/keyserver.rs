//! Public-key exchange routes.
//!
//! Peers start out knowing nothing about each other. A client first asks for
//! the server's public key, then registers its own:
//!
//! 1. `keyserver/server/get/public-key` returns the server key (PEM)
//! 2. `keyserver/client/<id>/set/public-key` with `{"public-key": pem}` stores
//!    the client key and switches the server session to secure mode for it
//!
//! Both run under the signature exemption since no key is trusted yet.

use std::sync::Arc;

use anyhow::{bail, ensure};
use serde_json::json;
use tracing::info;
use veil_common::{Config, KeyValueStore};
use veil_core::{Dispatcher, RouteOptions};
use veil_crypto::PublicKey;

use crate::error::Result;
use crate::session::TransportSession;

/// Route returning the server's public key.
pub const GET_PUBLIC_KEY: &str = "keyserver/server/get/public-key";

/// Route registering a client's public key; the wildcard is the client id.
pub const SET_PUBLIC_KEY: &str = "keyserver/client/+/set/public-key";

/// Configuration key of the currently paired remote key.
pub const REMOTE_KEY_CONFIG: &str = "remote-public-key";

/// Payload field carrying a PEM key.
pub const PUBLIC_KEY_FIELD: &str = "public-key";

/// Concrete registration topic for `client_id`.
pub fn set_public_key_topic(client_id: &str) -> String {
    format!("keyserver/client/{}/set/public-key", client_id)
}

/// Store key under which a client's public key is kept.
pub fn client_key_path(client_id: &str) -> String {
    format!("clients/{}/public-key", client_id)
}

/// Remote key persisted by an earlier pairing, if any.
pub fn paired_key(store: Arc<dyn KeyValueStore>) -> Option<String> {
    Config::new(store).get_or(REMOTE_KEY_CONFIG, None)
}

/// Register the key-exchange routes on `dispatcher`.
pub fn install(
    dispatcher: &mut Dispatcher,
    session: Arc<TransportSession>,
    store: Arc<dyn KeyValueStore>,
) -> Result<()> {
    let public_pem = session.identity().public_pem()?;
    dispatcher.route_with(
        GET_PUBLIC_KEY,
        RouteOptions::described("Returns the server's RSA public key as PKCS#1 PEM."),
        move |_, _| Ok(json!(public_pem)),
    );

    let config = Config::new(store.clone());
    dispatcher.route_with(
        SET_PUBLIC_KEY,
        RouteOptions::described(
            "Registers the caller's RSA public key (`{\"public-key\": pem}`) and pairs the server with it.",
        ),
        move |args, request| {
            let Some(client_id) = args.first() else {
                bail!("missing client id");
            };
            ensure!(
                request.sender_id.as_deref() == Some(client_id.as_str()),
                "sender {:?} cannot register key of '{}'",
                request.sender_id,
                client_id
            );

            let pem: String = request.field(PUBLIC_KEY_FIELD)?;
            ensure!(PublicKey::looks_like_pem(&pem), "not an RSA public key");
            let key = PublicKey::from_pem(&pem)?;

            store.set(&client_key_path(client_id), json!(pem))?;
            config.set(REMOTE_KEY_CONFIG, pem.as_str())?;
            session.update_remote_key(Some(&pem))?;

            info!(client = %client_id, fingerprint = %key.fingerprint(), "paired with client");
            Ok(json!(true))
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::session::SessionOptions;
    use crate::test_support::{identity, KEY_A, KEY_B};
    use veil_common::MemoryStore;
    use veil_core::{Outcome, Request};

    async fn server(store: Arc<dyn KeyValueStore>) -> (Dispatcher, Arc<TransportSession>) {
        let broker = MemoryBroker::new();
        let session = TransportSession::connect(&broker, SessionOptions::new(identity("server", KEY_A)))
            .await
            .unwrap();
        let session = Arc::new(session);
        let mut dispatcher = Dispatcher::new();
        install(&mut dispatcher, session.clone(), store).unwrap();
        (dispatcher, session)
    }

    fn registration(pem: &str) -> Request {
        Request::new(set_public_key_topic("bob"), json!({ PUBLIC_KEY_FIELD: pem }))
    }

    #[tokio::test]
    async fn test_get_public_key() {
        let (dispatcher, session) = server(Arc::new(MemoryStore::new())).await;
        let outcome = dispatcher.execute(GET_PUBLIC_KEY, &Request::new(GET_PUBLIC_KEY, json!({})));
        assert_eq!(outcome, Outcome::ok(json!(session.identity().public_pem().unwrap())));
    }

    #[tokio::test]
    async fn test_registration_pairs_session() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (dispatcher, session) = server(store.clone()).await;
        let pem = identity("bob", KEY_B).public_pem().unwrap();

        let request = registration(&pem).with_sender("bob");
        let outcome = dispatcher.execute(&request.topic, &request);
        assert_eq!(outcome, Outcome::ok(json!(true)));
        assert!(session.is_secure());
        assert_eq!(paired_key(store.clone()), Some(pem.clone()));
        assert_eq!(store.get(&client_key_path("bob")).unwrap(), Some(json!(pem)));
    }

    #[tokio::test]
    async fn test_registration_requires_matching_sender() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (dispatcher, session) = server(store.clone()).await;
        let pem = identity("bob", KEY_B).public_pem().unwrap();

        let anonymous = registration(&pem);
        let impostor = registration(&pem).with_sender("mallory");
        for request in [anonymous, impostor] {
            let outcome = dispatcher.execute(&request.topic, &request);
            assert!(!outcome.success);
        }
        assert!(!session.is_secure());
        assert_eq!(paired_key(store), None);
    }

    #[tokio::test]
    async fn test_registration_rejects_non_key() {
        let (dispatcher, session) = server(Arc::new(MemoryStore::new())).await;
        let request = registration("ssh-rsa AAAA").with_sender("bob");
        let outcome = dispatcher.execute(&request.topic, &request);
        assert_eq!(outcome, Outcome::failed("not an RSA public key"));
        assert!(!session.is_secure());
    }
}
