//! IEDSim Core - IPC backbone of the IEC 61850 device simulator.
//!
//! The GUI talks to this backend over a Unix domain socket using
//! length-prefixed msgpack envelopes. Each request names an action; the
//! backend routes it to a handler that manages simulated device servers
//! and outbound client associations through a pluggable model engine.
//!
//! # Layers
//!
//! - [`ipc`] - socket listener, worker pool, framing and the async client
//! - [`actions`] - action registry, router and the `server.*` / `client.*` handlers
//! - [`context`] - the process-wide instance registries behind one lock
//! - [`model_builder`] - turns a JSON-shaped model description into an [`engine::IedModel`]
//! - [`engine`] - the model-engine seam and the in-process [`engine::SimEngine`]
//! - [`network`] - host interface enumeration and address configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use iedsim_core::{ActionRegistry, BackendContext, IpcListener, Router, WorkerPool};
//! use iedsim_core::engine::SimEngine;
//! use iedsim_core::network::SystemNetwork;
//! use std::sync::Arc;
//!
//! let context = BackendContext::new(Arc::new(SimEngine::new()), Arc::new(SystemNetwork));
//! let router = Arc::new(Router::new(ActionRegistry::with_default_actions(), Arc::new(context)));
//! let pool = WorkerPool::new(4, Arc::new(move |body: &[u8]| router.handle_request(body)))?;
//! let handle = IpcListener::start("/tmp/iec61850_simulator.sock", Arc::new(pool))?;
//! ```

pub mod actions;
pub mod config;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod model_builder;
pub mod network;

// Re-export commonly used types
pub use actions::{ActionContext, ActionError, ActionHandler, ActionRegistry, Router};
pub use context::{BackendContext, BackendState};
pub use document::Document;
pub use error::{Result, SimError};
pub use ipc::{IpcClient, IpcListener, IpcServerHandle, Request, Response, WorkerPool};
pub use model_builder::{BuildWarning, BuiltModel};
