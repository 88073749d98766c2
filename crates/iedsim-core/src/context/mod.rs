//! Process-wide backend state.
//!
//! One [`BackendContext`] owns every server and client instance plus the
//! selected network interface. All mutation happens under its single mutex;
//! actions receive the locked [`BackendState`] and never touch the context
//! concurrently.
//!
//! Engine connection indications arrive on engine threads. They are turned
//! into [`ClientEvent`] messages and applied to the owning server's client
//! list the next time the context is locked, so the callback never needs
//! the context lock itself.

mod instance;
mod registry;

pub use instance::{ClientInfo, ClientInstance, ServerInstance};
pub use registry::{InstanceRegistry, RegistryEntry};

use crate::engine::{ConnectionEvent, ConnectionIndication, ModelEngine};
use crate::network::NetworkConfigurator;
use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Timestamp layout used for client connection times.
pub const CONNECTED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Peer connect/disconnect observed by one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub instance_id: String,
    pub peer: String,
    pub connected: bool,
    pub at: DateTime<Utc>,
}

/// Host interface that concrete server addresses are configured on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSelection {
    pub name: String,
    pub prefix_len: u8,
}

/// Everything guarded by the context mutex.
#[derive(Debug)]
pub struct BackendState {
    pub servers: InstanceRegistry<ServerInstance>,
    pub clients: InstanceRegistry<ClientInstance>,
    pub interface: Option<InterfaceSelection>,
    events: Receiver<ClientEvent>,
}

impl BackendState {
    fn apply_pending_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            let Some(server) = self.servers.get_mut(&event.instance_id) else {
                continue;
            };
            if event.connected {
                info!(
                    "Client {} connected to server {}",
                    event.peer, event.instance_id
                );
                server.clients.push(ClientInfo {
                    id: event.peer,
                    connected_at: event.at.format(CONNECTED_AT_FORMAT).to_string(),
                });
            } else {
                info!(
                    "Client {} disconnected from server {}",
                    event.peer, event.instance_id
                );
                server.clients.retain(|client| client.id != event.peer);
            }
        }
    }
}

/// Shared backend context handed to the router.
pub struct BackendContext {
    state: Mutex<BackendState>,
    events_tx: Sender<ClientEvent>,
    engine: Arc<dyn ModelEngine>,
    network: Arc<dyn NetworkConfigurator>,
}

impl BackendContext {
    pub fn new(engine: Arc<dyn ModelEngine>, network: Arc<dyn NetworkConfigurator>) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            state: Mutex::new(BackendState {
                servers: InstanceRegistry::default(),
                clients: InstanceRegistry::default(),
                interface: None,
                events,
            }),
            events_tx,
            engine,
            network,
        }
    }

    pub fn engine(&self) -> &dyn ModelEngine {
        self.engine.as_ref()
    }

    pub fn network(&self) -> &dyn NetworkConfigurator {
        self.network.as_ref()
    }

    /// Acquire the context lock and apply queued connection events.
    pub fn lock(&self) -> MutexGuard<'_, BackendState> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Backend context lock was poisoned; recovering");
            PoisonError::into_inner(poisoned)
        });
        state.apply_pending_events();
        state
    }

    /// Callback for the engine that reports peers of server `instance_id`.
    pub fn connection_indication(&self, instance_id: &str) -> ConnectionIndication {
        let tx = self.events_tx.clone();
        let instance_id = instance_id.to_string();
        Arc::new(move |event: ConnectionEvent| {
            let _ = tx.send(ClientEvent {
                instance_id: instance_id.clone(),
                peer: event.peer,
                connected: event.connected,
                at: Utc::now(),
            });
        })
    }
}

impl std::fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEngine;
    use crate::network::SystemNetwork;

    fn context() -> BackendContext {
        BackendContext::new(Arc::new(SimEngine::new()), Arc::new(SystemNetwork))
    }

    #[test]
    fn test_indication_events_apply_on_next_lock() {
        let ctx = context();
        ctx.lock().servers.get_or_create("ied1");

        let indication = ctx.connection_indication("ied1");
        indication(ConnectionEvent {
            peer: "127.0.0.1:50000".to_string(),
            connected: true,
        });
        indication(ConnectionEvent {
            peer: "127.0.0.1:50001".to_string(),
            connected: true,
        });

        {
            let state = ctx.lock();
            let clients = &state.servers.get("ied1").unwrap().clients;
            assert_eq!(clients.len(), 2);
            assert_eq!(clients[0].id, "127.0.0.1:50000");
            assert!(clients[0].connected_at.ends_with('Z'));
        }

        indication(ConnectionEvent {
            peer: "127.0.0.1:50000".to_string(),
            connected: false,
        });
        let state = ctx.lock();
        let clients = &state.servers.get("ied1").unwrap().clients;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, "127.0.0.1:50001");
    }

    #[test]
    fn test_events_for_unknown_instance_are_dropped() {
        let ctx = context();
        let indication = ctx.connection_indication("gone");
        indication(ConnectionEvent {
            peer: "127.0.0.1:50000".to_string(),
            connected: true,
        });
        let state = ctx.lock();
        assert!(state.servers.is_empty());
    }

    #[test]
    fn test_server_and_client_namespaces_are_independent() {
        let ctx = context();
        let mut state = ctx.lock();
        state.servers.get_or_create("x");
        assert!(state.clients.get("x").is_none());
        state.clients.get_or_create("x");
        assert!(state.servers.remove("x").is_some());
        assert!(state.clients.contains("x"));
    }
}
