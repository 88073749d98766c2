//! Model engine seam.
//!
//! The backend never implements the device protocol itself. It drives a
//! [`ModelEngine`] through create/teardown/read/write calls and holds every
//! engine resource in an owned handle whose `Drop` is the single destroyer:
//!
//! - [`ModelHandle`] - a built device model plus the engine's data-model lock
//! - [`ServerConfigHandle`] - server tuning (connection limit)
//! - [`ServerHandle`] - a protocol server bound to one model
//! - [`ConnectionHandle`] - an outbound client association
//!
//! [`SimEngine`] is the in-process engine used by the backend binary and
//! the tests.

pub mod model;
mod sim;
mod types;
mod value;

pub use model::{IedModel, NodeId, NodeKind};
pub use sim::SimEngine;
pub use types::{AttributeType, FunctionalConstraint};
pub use value::MmsValue;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Failure reported by the model engine. The display text is forwarded to
/// callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Address already in use")]
    AddressInUse,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection rejected")]
    ConnectionRejected,
    #[error("Not connected")]
    NotConnected,
    #[error("Object does not exist")]
    ObjectDoesNotExist,
    #[error("Type mismatch")]
    TypeMismatch,
    #[error("Timeout")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Peer connect/disconnect notification from a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub peer: String,
    pub connected: bool,
}

/// Callback the engine invokes on its own thread for every [`ConnectionEvent`].
pub type ConnectionIndication = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Server tuning handed to [`ModelEngine::create_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub max_connections: u32,
}

/// Timeouts for an outbound association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

/// The protocol engine.
pub trait ModelEngine: Send + Sync {
    /// Take ownership of a built model.
    fn create_model(&self, model: IedModel) -> ModelHandle {
        ModelHandle::new(model)
    }

    fn create_server_config(&self, max_connections: u32) -> ServerConfigHandle {
        ServerConfigHandle::new(ServerConfig { max_connections })
    }

    /// Create a (stopped) server that serves `model`.
    fn create_server(
        &self,
        model: &ModelHandle,
        config: &ServerConfigHandle,
        indication: ConnectionIndication,
    ) -> EngineResult<ServerHandle>;

    /// Open an association to a remote server.
    fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> EngineResult<ConnectionHandle>;
}

pub trait EngineServer: Send {
    fn start(&mut self, port: u16) -> EngineResult<()>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn set_local_address(&mut self, ip: &str);
}

pub trait EngineConnection: Send {
    /// Name of the remote device, if the engine knows it.
    fn ied_name(&self) -> Option<String>;
    fn read(&self, reference: &str, fc: FunctionalConstraint) -> EngineResult<MmsValue>;
    fn write(&self, reference: &str, fc: FunctionalConstraint, value: &MmsValue)
        -> EngineResult<()>;
    fn logical_devices(&self) -> EngineResult<Vec<String>>;
    fn logical_nodes(&self, ld: &str) -> EngineResult<Vec<String>>;
    /// Data objects of `ld/ln`, with their CDC when known.
    fn data_objects(&self, ld: &str, ln: &str) -> EngineResult<Vec<(String, Option<String>)>>;
    fn data_directory(&self, ld: &str, ln: &str, data_object: &str) -> EngineResult<Vec<String>>;
    /// Upper bound on one request; exceeding it yields [`EngineError::Timeout`].
    fn request_timeout(&self) -> Duration;
    fn close(&mut self);
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Owned handles
// ============================================================================

/// A device model owned by the engine, shared with the server that serves it.
#[derive(Debug)]
pub struct DataModel {
    ied_name: String,
    model: Mutex<IedModel>,
}

impl DataModel {
    pub fn ied_name(&self) -> &str {
        &self.ied_name
    }

    /// Take the engine's exclusive data-model lock.
    pub fn lock(&self) -> MutexGuard<'_, IedModel> {
        lock_unpoisoned(&self.model)
    }

    /// Take the data-model lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, IedModel>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.model.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => return None,
                Err(TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

/// Owned device-model handle.
#[derive(Debug)]
pub struct ModelHandle {
    inner: Arc<DataModel>,
}

impl ModelHandle {
    pub fn new(model: IedModel) -> Self {
        Self {
            inner: Arc::new(DataModel {
                ied_name: model.name().to_string(),
                model: Mutex::new(model),
            }),
        }
    }

    pub fn ied_name(&self) -> &str {
        self.inner.ied_name()
    }

    pub fn lock(&self) -> MutexGuard<'_, IedModel> {
        self.inner.lock()
    }

    /// Shared view for engine components that serve this model.
    pub fn shared(&self) -> Arc<DataModel> {
        Arc::clone(&self.inner)
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        trace!("Releasing model {}", self.inner.ied_name);
    }
}

/// Owned server-configuration handle.
#[derive(Debug)]
pub struct ServerConfigHandle {
    config: ServerConfig,
}

impl ServerConfigHandle {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Owned server handle. Dropping it stops the server.
pub struct ServerHandle {
    inner: Box<dyn EngineServer>,
}

impl ServerHandle {
    pub fn new(inner: Box<dyn EngineServer>) -> Self {
        Self { inner }
    }
}

impl Deref for ServerHandle {
    type Target = dyn EngineServer;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for ServerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.inner.is_running() {
            self.inner.stop();
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("running", &self.inner.is_running())
            .finish()
    }
}

/// Owned client-connection handle. Dropping it closes the association.
pub struct ConnectionHandle {
    inner: Box<dyn EngineConnection>,
}

impl ConnectionHandle {
    pub fn new(inner: Box<dyn EngineConnection>) -> Self {
        Self { inner }
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn EngineConnection;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for ConnectionHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").finish_non_exhaustive()
    }
}
