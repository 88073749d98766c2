//! In-process model engine.
//!
//! Servers created by one [`SimEngine`] register on their port in a shared
//! listener table; connections opened through the same engine resolve
//! against that table and operate directly on the served model under its
//! data-model lock. No protocol bytes are produced.

use super::{
    lock_unpoisoned, ConnectOptions, ConnectionEvent, ConnectionHandle, ConnectionIndication,
    DataModel, EngineConnection, EngineError, EngineResult, EngineServer, FunctionalConstraint,
    ModelEngine, ModelHandle, MmsValue, NodeKind, ServerConfigHandle, ServerHandle,
};
use crate::engine::{AttributeType, IedModel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::debug;

const EPHEMERAL_PORT_BASE: u32 = 49152;
const EPHEMERAL_PORT_SPAN: u32 = 16384;

/// Engine whose servers and connections live in this process.
#[derive(Default)]
pub struct SimEngine {
    network: Arc<SimNetwork>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of servers currently accepting connections.
    pub fn running_servers(&self) -> usize {
        lock_unpoisoned(&self.network.listeners)
            .values()
            .filter_map(Weak::upgrade)
            .filter(|core| core.is_running())
            .count()
    }
}

#[derive(Default)]
struct SimNetwork {
    listeners: Mutex<HashMap<u16, Weak<SimServerCore>>>,
    next_peer: AtomicU32,
}

impl SimNetwork {
    fn next_peer_address(&self) -> String {
        let n = self.next_peer.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORT_SPAN;
        format!("127.0.0.1:{}", EPHEMERAL_PORT_BASE + n)
    }
}

struct SimServerCore {
    model: Arc<DataModel>,
    max_connections: u32,
    indication: ConnectionIndication,
    state: Mutex<SimServerState>,
}

struct SimServerState {
    running: bool,
    port: Option<u16>,
    local_ip: String,
    connections: HashMap<u64, String>,
    next_connection: u64,
}

impl SimServerCore {
    fn is_running(&self) -> bool {
        lock_unpoisoned(&self.state).running
    }

    fn accepts_host(local_ip: &str, host: &str) -> bool {
        local_ip == "0.0.0.0"
            || local_ip == host
            || (host == "localhost" && local_ip.starts_with("127."))
    }

    /// Remove one connection, notifying if it was still registered.
    fn drop_connection(&self, connection: u64) {
        let peer = lock_unpoisoned(&self.state).connections.remove(&connection);
        if let Some(peer) = peer {
            (self.indication)(ConnectionEvent {
                peer,
                connected: false,
            });
        }
    }
}

impl ModelEngine for SimEngine {
    fn create_server(
        &self,
        model: &ModelHandle,
        config: &ServerConfigHandle,
        indication: ConnectionIndication,
    ) -> EngineResult<ServerHandle> {
        let core = Arc::new(SimServerCore {
            model: model.shared(),
            max_connections: config.config().max_connections,
            indication,
            state: Mutex::new(SimServerState {
                running: false,
                port: None,
                local_ip: "0.0.0.0".to_string(),
                connections: HashMap::new(),
                next_connection: 1,
            }),
        });
        Ok(ServerHandle::new(Box::new(SimServer {
            core,
            network: Arc::clone(&self.network),
        })))
    }

    fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> EngineResult<ConnectionHandle> {
        let core = lock_unpoisoned(&self.network.listeners)
            .get(&port)
            .and_then(Weak::upgrade)
            .ok_or(EngineError::ConnectionRefused)?;

        let peer = self.network.next_peer_address();
        let id = {
            let mut state = lock_unpoisoned(&core.state);
            if !state.running || !SimServerCore::accepts_host(&state.local_ip, host) {
                return Err(EngineError::ConnectionRefused);
            }
            if state.connections.len() >= core.max_connections as usize {
                return Err(EngineError::ConnectionRejected);
            }
            let id = state.next_connection;
            state.next_connection += 1;
            state.connections.insert(id, peer.clone());
            id
        };

        debug!("Simulated association {} -> {}:{}", peer, host, port);
        (core.indication)(ConnectionEvent {
            peer: peer.clone(),
            connected: true,
        });

        Ok(ConnectionHandle::new(Box::new(SimConnection {
            server: Arc::downgrade(&core),
            id,
            open: true,
            request_timeout: Duration::from_millis(options.request_timeout_ms),
        })))
    }
}

struct SimServer {
    core: Arc<SimServerCore>,
    network: Arc<SimNetwork>,
}

impl EngineServer for SimServer {
    fn start(&mut self, port: u16) -> EngineResult<()> {
        let mut listeners = lock_unpoisoned(&self.network.listeners);
        if let Some(existing) = listeners.get(&port).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, &self.core) && existing.is_running() {
                return Err(EngineError::AddressInUse);
            }
        }

        let mut state = lock_unpoisoned(&self.core.state);
        if let Some(previous) = state.port.filter(|p| *p != port) {
            let ours = listeners
                .get(&previous)
                .map(|w| Weak::ptr_eq(w, &Arc::downgrade(&self.core)))
                .unwrap_or(false);
            if ours {
                listeners.remove(&previous);
            }
        }
        listeners.insert(port, Arc::downgrade(&self.core));
        state.port = Some(port);
        state.running = true;
        debug!("Simulated server listening on {}:{}", state.local_ip, port);
        Ok(())
    }

    fn stop(&mut self) {
        let (port, peers) = {
            let mut state = lock_unpoisoned(&self.core.state);
            if !state.running {
                return;
            }
            state.running = false;
            let peers: Vec<String> = state.connections.drain().map(|(_, peer)| peer).collect();
            (state.port, peers)
        };

        if let Some(port) = port {
            let mut listeners = lock_unpoisoned(&self.network.listeners);
            let ours = listeners
                .get(&port)
                .map(|w| Weak::ptr_eq(w, &Arc::downgrade(&self.core)))
                .unwrap_or(false);
            if ours {
                listeners.remove(&port);
            }
        }

        for peer in peers {
            (self.core.indication)(ConnectionEvent {
                peer,
                connected: false,
            });
        }
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn set_local_address(&mut self, ip: &str) {
        lock_unpoisoned(&self.core.state).local_ip = ip.to_string();
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SimConnection {
    server: Weak<SimServerCore>,
    id: u64,
    open: bool,
    request_timeout: Duration,
}

impl SimConnection {
    fn server(&self) -> EngineResult<Arc<SimServerCore>> {
        if !self.open {
            return Err(EngineError::NotConnected);
        }
        let core = self.server.upgrade().ok_or(EngineError::NotConnected)?;
        let alive = {
            let state = lock_unpoisoned(&core.state);
            state.running && state.connections.contains_key(&self.id)
        };
        if alive {
            Ok(core)
        } else {
            Err(EngineError::NotConnected)
        }
    }

    fn lock_model<'a>(&self, core: &'a SimServerCore) -> EngineResult<MutexGuard<'a, IedModel>> {
        core.model
            .try_lock_for(self.request_timeout)
            .ok_or(EngineError::Timeout)
    }
}

impl EngineConnection for SimConnection {
    fn ied_name(&self) -> Option<String> {
        self.server
            .upgrade()
            .map(|core| core.model.ied_name().to_string())
    }

    fn read(&self, reference: &str, fc: FunctionalConstraint) -> EngineResult<MmsValue> {
        let core = self.server()?;
        let model = self.lock_model(&core)?;
        let id = model
            .find_by_reference(reference)
            .ok_or(EngineError::ObjectDoesNotExist)?;
        model
            .read_value(id, fc)
            .ok_or(EngineError::ObjectDoesNotExist)
    }

    fn write(
        &self,
        reference: &str,
        fc: FunctionalConstraint,
        value: &MmsValue,
    ) -> EngineResult<()> {
        let core = self.server()?;
        let mut model = self.lock_model(&core)?;
        let id = model
            .find_by_reference(reference)
            .ok_or(EngineError::ObjectDoesNotExist)?;
        let attr_type = match model.attribute(id) {
            Some(attr) if attr.fc == fc => attr.attr_type,
            _ => return Err(EngineError::ObjectDoesNotExist),
        };
        if attr_type == AttributeType::Constructed {
            return Err(EngineError::TypeMismatch);
        }
        let coerced = MmsValue::from_document(&value.to_document(), attr_type)
            .ok_or(EngineError::TypeMismatch)?;
        model.set_value(id, coerced);
        Ok(())
    }

    fn logical_devices(&self) -> EngineResult<Vec<String>> {
        let core = self.server()?;
        let model = self.lock_model(&core)?;
        Ok(model
            .logical_devices()
            .map(|ld| model.node(ld).name.clone())
            .collect())
    }

    fn logical_nodes(&self, ld: &str) -> EngineResult<Vec<String>> {
        let core = self.server()?;
        let model = self.lock_model(&core)?;
        let ld = model
            .find_logical_device(ld)
            .ok_or(EngineError::ObjectDoesNotExist)?;
        Ok(model
            .node(ld)
            .children
            .iter()
            .map(|ln| model.node(*ln).name.clone())
            .collect())
    }

    fn data_objects(&self, ld: &str, ln: &str) -> EngineResult<Vec<(String, Option<String>)>> {
        let core = self.server()?;
        let model = self.lock_model(&core)?;
        let ln = model
            .find_by_reference(&format!("{}/{}", ld, ln))
            .ok_or(EngineError::ObjectDoesNotExist)?;
        Ok(model
            .node(ln)
            .children
            .iter()
            .filter_map(|child| match &model.node(*child).kind {
                NodeKind::DataObject { cdc } => Some((model.node(*child).name.clone(), cdc.clone())),
                _ => None,
            })
            .collect())
    }

    fn data_directory(&self, ld: &str, ln: &str, data_object: &str) -> EngineResult<Vec<String>> {
        let core = self.server()?;
        let model = self.lock_model(&core)?;
        let node = model
            .find_by_reference(&format!("{}/{}.{}", ld, ln, data_object))
            .ok_or(EngineError::ObjectDoesNotExist)?;
        Ok(model
            .node(node)
            .children
            .iter()
            .map(|child| model.node(*child).name.clone())
            .collect())
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(core) = self.server.upgrade() {
            core.drop_connection(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn model() -> ModelHandle {
        let mut model = IedModel::new("SimIED");
        let ld = model.create_logical_device("MEAS");
        let ln = model.create_logical_node(ld, "MMXU1");
        let hz = model.create_data_object(ln, "Hz", Some("MV"));
        let mag = model.create_data_attribute(
            hz,
            "mag",
            AttributeType::Constructed,
            FunctionalConstraint::MX,
            0,
        );
        let f = model.create_data_attribute(mag, "f", AttributeType::Float32, FunctionalConstraint::MX, 0);
        model.set_value(f, MmsValue::Float(50.0));
        model.create_data_attribute(hz, "d", AttributeType::VisString255, FunctionalConstraint::DC, 0);
        ModelHandle::new(model)
    }

    fn recorder() -> (ConnectionIndication, Arc<StdMutex<Vec<ConnectionEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let indication: ConnectionIndication = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (indication, events)
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            connect_timeout_ms: 1000,
            request_timeout_ms: 1000,
        }
    }

    #[test]
    fn test_connect_read_write_and_indications() {
        let engine = SimEngine::new();
        let model = model();
        let config = engine.create_server_config(4);
        let (indication, events) = recorder();
        let mut server = engine.create_server(&model, &config, indication).unwrap();
        server.start(10102).unwrap();
        assert_eq!(engine.running_servers(), 1);

        let mut conn = engine.connect("127.0.0.1", 10102, &options()).unwrap();
        assert_eq!(conn.ied_name().as_deref(), Some("SimIED"));
        assert_eq!(
            conn.read("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::MX),
            Ok(MmsValue::Float(50.0))
        );
        assert_eq!(
            conn.read("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::ST),
            Err(EngineError::ObjectDoesNotExist)
        );

        conn.write("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::MX, &MmsValue::Integer(60))
            .unwrap();
        assert_eq!(
            conn.read("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::MX),
            Ok(MmsValue::Float(60.0))
        );
        assert_eq!(
            conn.write("MEAS/MMXU1.Hz.d", FunctionalConstraint::DC, &MmsValue::Boolean(true)),
            Err(EngineError::TypeMismatch)
        );

        conn.close();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].connected);
        assert!(!events[1].connected);
        assert_eq!(events[0].peer, events[1].peer);
    }

    #[test]
    fn test_port_conflict_and_refusal() {
        let engine = SimEngine::new();
        let first = model();
        let second = model();
        let config = engine.create_server_config(1);
        let (indication, _) = recorder();

        let mut a = engine.create_server(&first, &config, indication.clone()).unwrap();
        let mut b = engine.create_server(&second, &config, indication).unwrap();
        a.start(10200).unwrap();
        assert_eq!(b.start(10200), Err(EngineError::AddressInUse));

        assert_eq!(
            engine.connect("127.0.0.1", 10201, &options()).err(),
            Some(EngineError::ConnectionRefused)
        );

        let _held = engine.connect("127.0.0.1", 10200, &options()).unwrap();
        assert_eq!(
            engine.connect("127.0.0.1", 10200, &options()).err(),
            Some(EngineError::ConnectionRejected)
        );

        a.stop();
        assert!(b.start(10200).is_ok());
    }

    #[test]
    fn test_stop_drops_connections() {
        let engine = SimEngine::new();
        let model = model();
        let config = engine.create_server_config(4);
        let (indication, events) = recorder();
        let mut server = engine.create_server(&model, &config, indication).unwrap();
        server.set_local_address("10.0.0.5");
        server.start(10300).unwrap();

        assert_eq!(
            engine.connect("127.0.0.1", 10300, &options()).err(),
            Some(EngineError::ConnectionRefused)
        );
        let conn = engine.connect("10.0.0.5", 10300, &options()).unwrap();

        drop(server);
        assert_eq!(
            conn.read("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::MX),
            Err(EngineError::NotConnected)
        );
        let disconnects = events.lock().unwrap().iter().filter(|e| !e.connected).count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_request_timeout_is_carried_and_enforced() {
        let engine = SimEngine::new();
        let model = model();
        let config = engine.create_server_config(4);
        let (indication, _events) = recorder();
        let mut server = engine.create_server(&model, &config, indication).unwrap();
        server.start(10400).unwrap();

        let options = ConnectOptions {
            connect_timeout_ms: 1000,
            request_timeout_ms: 30,
        };
        let conn = engine.connect("127.0.0.1", 10400, &options).unwrap();
        assert_eq!(conn.request_timeout(), Duration::from_millis(30));

        let guard = model.lock();
        assert_eq!(
            conn.read("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::MX),
            Err(EngineError::Timeout)
        );
        drop(guard);
        assert_eq!(
            conn.read("MEAS/MMXU1.Hz.mag.f", FunctionalConstraint::MX),
            Ok(MmsValue::Float(50.0))
        );
    }
}
