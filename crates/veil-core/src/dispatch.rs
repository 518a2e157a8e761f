//! Route dispatch.
//!
//! A [`Dispatcher`] maps topics to handlers. Handlers receive the wildcard
//! captures of their pattern plus the [`Request`], and return a JSON value.
//! Whatever happens inside a handler comes back as an [`Outcome`]:
//!
//! | handler result        | outcome                         |
//! |-----------------------|---------------------------------|
//! | `Ok(Value::Bool(b))`  | `success = b`, `result = null`  |
//! | `Ok(value)`           | `success = true`, `result = value` |
//! | `Err(e)` or panic     | `success = false`, `result = "<message>"` |
//!
//! Routes are tried in registration order; the first match wins.

use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::topic;
use crate::ENDPOINT_NOT_FOUND;

type Handler = Arc<dyn Fn(&[String], &Request) -> anyhow::Result<Value> + Send + Sync>;

/// Context handed to a route handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub topic: String,
    pub payload: Value,
    pub sender_id: Option<String>,
}

impl Request {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            sender_id: None,
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    /// Deserialize the payload field `key`.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .payload
            .get(key)
            .with_context(|| format!("missing field '{}'", key))?;
        serde_json::from_value(value.clone()).with_context(|| format!("invalid field '{}'", key))
    }
}

/// Result of executing a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub result: Value,
}

impl Outcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::String(message.into()),
        }
    }

    /// Reply body: `{"success": bool, "result": value}`.
    pub fn to_value(&self) -> Value {
        json!({ "success": self.success, "result": self.result })
    }

    fn from_handler(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(Value::Bool(success)) => Self {
                success,
                result: Value::Null,
            },
            Ok(value) => Self::ok(value),
            Err(e) => Self::failed(format!("{:#}", e)),
        }
    }
}

/// Per-route settings.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Human-readable description for the generated documentation.
    pub description: Option<String>,
}

impl RouteOptions {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// When set, the Markdown documentation is rewritten here after every `route` call.
    pub documentation_path: Option<PathBuf>,
}

struct Route {
    pattern: String,
    options: RouteOptions,
    handler: Handler,
}

/// Topic-to-handler table.
#[derive(Default)]
pub struct Dispatcher {
    routes: Vec<Route>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            routes: Vec::new(),
            config,
        }
    }

    /// Register `handler` under `pattern`.
    pub fn route<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&[String], &Request) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.route_with(pattern, RouteOptions::default(), handler)
    }

    /// Register `handler` under `pattern` with options.
    ///
    /// Registering a pattern again replaces the earlier handler in place.
    pub fn route_with<F>(&mut self, pattern: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(&[String], &Request) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        if !topic::is_valid_pattern(pattern) {
            warn!(pattern, "registering malformed route pattern");
        }
        let route = Route {
            pattern: pattern.to_string(),
            options,
            handler: Arc::new(handler),
        };
        match self.routes.iter_mut().find(|r| r.pattern == pattern) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
        debug!(pattern, routes = self.routes.len(), "route registered");
        self.write_documentation();
        self
    }

    /// Execute the first route matching `topic`.
    pub fn execute(&self, topic: &str, request: &Request) -> Outcome {
        let Some((route, captured)) = self
            .routes
            .iter()
            .find_map(|route| topic::captures(&route.pattern, topic).map(|c| (route, c)))
        else {
            warn!(topic, "endpoint not found");
            return Outcome::failed(ENDPOINT_NOT_FOUND);
        };

        let handler = &route.handler;
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler(&captured, request))) {
            Ok(result) => Outcome::from_handler(result),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Outcome::failed(message)
            }
        };
        if !outcome.success {
            if let Value::String(message) = &outcome.result {
                error!(topic, pattern = %route.pattern, error = %message, "handler failed");
            }
        }
        outcome
    }

    /// Registered patterns in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Markdown description of every route, sorted by pattern.
    pub fn documentation(&self) -> String {
        let mut routes: Vec<&Route> = self.routes.iter().collect();
        routes.sort_by(|a, b| a.pattern.cmp(&b.pattern));

        let mut doc = String::from("# API Documentation\n");
        for route in routes {
            let description = route
                .options
                .description
                .as_deref()
                .unwrap_or("No documentation available!");
            let _ = write!(doc, "\n## `{}`\n\n{}\n", route.pattern, description);
        }
        doc
    }

    fn write_documentation(&self) {
        let Some(path) = &self.config.documentation_path else {
            return;
        };
        if let Err(e) = std::fs::write(path, self.documentation()) {
            error!(path = %path.display(), error = %e, "failed to write API documentation");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("patterns", &self.patterns().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}
