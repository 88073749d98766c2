//! Action dispatch.
//!
//! Every request names an action (`server.start`, `client.read`, ...). The
//! [`ActionRegistry`] maps names to [`ActionHandler`]s; the [`Router`] runs
//! the shared pre-checks, takes the backend lock and invokes the handler.
//! Handlers return a payload or an [`ActionError`]; the router turns either
//! into a response envelope, so no failure escapes a request.

mod client;
mod params;
mod server;

pub use client::register_client_actions;
pub use server::register_server_actions;

use crate::context::{BackendContext, BackendState};
use crate::document::Document;
use crate::engine::EngineError;
use crate::ipc::protocol::{Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Failure of a single action. The display text is what the caller sees in
/// the response's `error.message`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotInitialized(String),

    #[error("{0}")]
    Engine(String),

    #[error("Unknown action")]
    UnknownAction(String),
}

impl ActionError {
    /// Stable tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::Decode(_) => "decode",
            ActionError::Validation(_) => "validation",
            ActionError::NotInitialized(_) => "not_initialized",
            ActionError::Engine(_) => "engine",
            ActionError::UnknownAction(_) => "unknown_action",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ActionError::Validation(message.into())
    }
}

impl From<EngineError> for ActionError {
    fn from(err: EngineError) -> Self {
        ActionError::Engine(err.to_string())
    }
}

/// Everything a handler may touch while the backend lock is held.
pub struct ActionContext<'a> {
    pub action: &'a str,
    pub payload: &'a Document,
    /// Validated id for handlers that require one, `""` otherwise.
    pub instance_id: &'a str,
    pub state: &'a mut BackendState,
    pub backend: &'a BackendContext,
}

/// One named action.
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the payload must be a map. Checked before the lock is taken.
    fn requires_payload(&self) -> bool {
        true
    }

    /// Whether `payload.instance_id` must be a non-empty string.
    fn requires_instance_id(&self) -> bool {
        true
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError>;
}

/// Name-to-handler table, built explicitly at startup.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<&'static str, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every server and client action.
    pub fn with_default_actions() -> Self {
        let mut registry = Self::new();
        register_server_actions(&mut registry);
        register_client_actions(&mut registry);
        registry
    }

    /// Add a handler. A later handler with the same name replaces the earlier one.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        if self.handlers.insert(handler.name(), handler).is_some() {
            warn!("Replaced an already registered action handler");
        }
    }

    pub fn find(&self, name: &str) -> Option<&dyn ActionHandler> {
        self.handlers.get(name).map(|handler| handler.as_ref())
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Routes decoded requests to handlers under the backend lock.
#[derive(Debug)]
pub struct Router {
    registry: ActionRegistry,
    context: Arc<BackendContext>,
}

impl Router {
    pub fn new(registry: ActionRegistry, context: Arc<BackendContext>) -> Self {
        Self { registry, context }
    }

    pub fn context(&self) -> &Arc<BackendContext> {
        &self.context
    }

    /// Run one action. `payload` is `None` when the request carried none.
    pub fn dispatch(&self, action: &str, payload: Option<&Document>) -> Result<Document, ActionError> {
        let handler = self
            .registry
            .find(action)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;

        let nil = Document::Nil;
        let payload = payload.unwrap_or(&nil);
        if handler.requires_payload() && !payload.is_map() {
            return Err(ActionError::validation("Missing payload"));
        }
        let instance_id = if handler.requires_instance_id() {
            params::instance_id(payload)
                .ok_or_else(|| ActionError::validation("instance_id is required"))?
        } else {
            ""
        };

        let mut state = self.context.lock();
        let mut ctx = ActionContext {
            action,
            payload,
            instance_id,
            state: &mut state,
            backend: &self.context,
        };
        handler.handle(&mut ctx)
    }

    /// Decode a request body, dispatch it and encode the response body.
    pub fn handle_request(&self, bytes: &[u8]) -> Vec<u8> {
        let response = match Request::decode(bytes) {
            Err(err) => {
                let err = ActionError::Decode(codec_message(&err));
                error!("{}", err);
                Response::failure("", err.to_string())
            }
            Ok(request) => {
                debug!("IPC action: {} id={}", request.action, request.id);
                match self.dispatch(&request.action, request.payload.as_ref()) {
                    Ok(payload) => Response::success(request.id, payload),
                    Err(err) => {
                        warn!(
                            action = %request.action,
                            kind = err.kind(),
                            "Action failed: {}",
                            err
                        );
                        Response::failure(request.id, err.to_string())
                    }
                }
            }
        };
        encode_response(&response)
    }
}

fn codec_message(err: &crate::SimError) -> String {
    match err {
        crate::SimError::Codec { message } => message.clone(),
        other => other.to_string(),
    }
}

/// Encode a response, degrading to a bare error envelope if the payload
/// itself cannot be encoded.
pub(crate) fn encode_response(response: &Response) -> Vec<u8> {
    match response.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Failed to encode response {}: {}", response.id, err);
            Response::failure(response.id.clone(), format!("Encode error: {}", err))
                .encode()
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEngine;
    use crate::network::SystemNetwork;

    struct Echo;

    impl ActionHandler for Echo {
        fn name(&self) -> &'static str {
            "test.echo"
        }

        fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
            Ok([("instance_id", Document::from(ctx.instance_id))]
                .into_iter()
                .collect())
        }
    }

    fn router() -> Router {
        let mut registry = ActionRegistry::with_default_actions();
        registry.register(Box::new(Echo));
        let context = BackendContext::new(Arc::new(SimEngine::new()), Arc::new(SystemNetwork));
        Router::new(registry, Arc::new(context))
    }

    fn payload(id: &str) -> Document {
        [("instance_id", Document::from(id))].into_iter().collect()
    }

    #[test]
    fn test_default_catalog() {
        let registry = ActionRegistry::with_default_actions();
        assert_eq!(registry.len(), 17);
        for name in [
            "server.load_model",
            "server.start",
            "server.stop",
            "server.remove",
            "server.set_data_value",
            "server.get_values",
            "server.get_clients",
            "server.list_instances",
            "server.get_interfaces",
            "server.set_interface",
            "client.connect",
            "client.disconnect",
            "client.browse",
            "client.read",
            "client.read_batch",
            "client.write",
            "client.list_instances",
        ] {
            assert!(registry.find(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn test_unknown_action() {
        let err = router().dispatch("server.explode", None).unwrap_err();
        assert_eq!(err.to_string(), "Unknown action");
    }

    #[test]
    fn test_prechecks_run_in_order() {
        let router = router();
        assert_eq!(
            router.dispatch("test.echo", None).unwrap_err().to_string(),
            "Missing payload"
        );
        assert_eq!(
            router
                .dispatch("test.echo", Some(&Document::from(3)))
                .unwrap_err()
                .to_string(),
            "Missing payload"
        );
        assert_eq!(
            router
                .dispatch("test.echo", Some(&Document::empty_map()))
                .unwrap_err()
                .to_string(),
            "instance_id is required"
        );
        assert_eq!(
            router
                .dispatch("test.echo", Some(&payload("")))
                .unwrap_err()
                .to_string(),
            "instance_id is required"
        );
        let ok = router.dispatch("test.echo", Some(&payload("a"))).unwrap();
        assert_eq!(ok.str_field("instance_id"), Some("a"));
    }

    #[test]
    fn test_handle_request_decode_error_envelope() {
        let bytes = router().handle_request(&[0xc1]);
        let response = Response::decode(&bytes).unwrap();
        assert_eq!(response.id, "");
        assert!(response
            .error
            .as_deref()
            .is_some_and(|m| m.starts_with("Decode error: ")));
    }

    #[test]
    fn test_handle_request_round_trip() {
        let request = Request::new("req-1", "test.echo", payload("x"));
        let bytes = router().handle_request(&request.encode().unwrap());
        let response = Response::decode(&bytes).unwrap();
        assert_eq!(response.id, "req-1");
        assert!(response.error.is_none());
        assert_eq!(response.payload.str_field("instance_id"), Some("x"));
    }
}
