//! Server- and client-role instances and their owned engine handles.

use super::registry::RegistryEntry;
use crate::config::{ClientDefaults, ServerDefaults};
use crate::engine::{
    ConnectionHandle, ConnectionIndication, EngineResult, ModelEngine, ModelHandle,
    ServerConfigHandle, ServerHandle,
};
use tracing::debug;

/// A peer connected to a simulated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Peer address.
    pub id: String,
    /// `%Y-%m-%dT%H:%M:%SZ`
    pub connected_at: String,
}

/// A simulated device server.
#[derive(Debug)]
pub struct ServerInstance {
    pub instance_id: String,
    pub ied_name: String,
    pub ip_address: String,
    pub port: u16,
    pub max_connections: u32,
    pub clients: Vec<ClientInfo>,
    pub running: bool,
    pub ip_configured: bool,
    engine_server: Option<ServerHandle>,
    engine_config: Option<ServerConfigHandle>,
    model: Option<ModelHandle>,
}

impl RegistryEntry for ServerInstance {
    fn create(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ied_name: ServerDefaults::IED_NAME.to_string(),
            ip_address: ServerDefaults::IP_ADDRESS.to_string(),
            port: ServerDefaults::PORT,
            max_connections: ServerDefaults::MAX_CONNECTIONS,
            clients: Vec::new(),
            running: false,
            ip_configured: false,
            engine_server: None,
            engine_config: None,
            model: None,
        }
    }
}

impl ServerInstance {
    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn has_engine_server(&self) -> bool {
        self.engine_server.is_some()
    }

    pub fn engine_server_mut(&mut self) -> Option<&mut ServerHandle> {
        self.engine_server.as_mut()
    }

    /// Whether the engine reports the server as accepting connections.
    pub fn engine_running(&self) -> bool {
        self.engine_server
            .as_ref()
            .map(|server| server.is_running())
            .unwrap_or(false)
    }

    /// Install a freshly built model. Any previous handles are released first.
    pub fn install_model(&mut self, model: ModelHandle) {
        self.release_engine();
        self.ied_name = model.ied_name().to_string();
        self.model = Some(model);
    }

    /// Create the engine config and server if they are missing.
    pub fn ensure_engine_server(
        &mut self,
        engine: &dyn ModelEngine,
        indication: ConnectionIndication,
    ) -> EngineResult<()> {
        let Some(model) = self.model.as_ref() else {
            return Ok(());
        };
        if self.engine_config.is_none() {
            self.engine_config = Some(engine.create_server_config(self.max_connections));
        }
        if self.engine_server.is_none() {
            if let Some(config) = self.engine_config.as_ref() {
                self.engine_server = Some(engine.create_server(model, config, indication)?);
            }
        }
        Ok(())
    }

    /// Stop the protocol server without releasing anything.
    pub fn stop(&mut self) {
        if let Some(server) = self.engine_server.as_mut() {
            server.stop();
        }
        self.running = false;
    }

    /// Release server, config and model, in that order.
    pub fn release_engine(&mut self) {
        if let Some(mut server) = self.engine_server.take() {
            server.stop();
        }
        self.engine_config = None;
        if self.model.take().is_some() {
            debug!("Released engine handles for server {}", self.instance_id);
        }
        self.running = false;
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.release_engine();
    }
}

/// An outbound client association.
#[derive(Debug)]
pub struct ClientInstance {
    pub instance_id: String,
    pub target_host: String,
    pub target_port: u16,
    pub ied_name: String,
    pub connected: bool,
    pub timeout_ms: u64,
    connection: Option<ConnectionHandle>,
}

impl RegistryEntry for ClientInstance {
    fn create(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            target_host: String::new(),
            target_port: ClientDefaults::PORT,
            ied_name: ClientDefaults::IED_NAME.to_string(),
            connected: false,
            timeout_ms: ClientDefaults::REQUEST_TIMEOUT_MS,
            connection: None,
        }
    }
}

impl ClientInstance {
    /// The live connection, if any.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref().filter(|_| self.connected)
    }

    pub fn attach(&mut self, connection: ConnectionHandle) {
        self.release_connection();
        if let Some(name) = connection.ied_name() {
            self.ied_name = name;
        }
        self.connection = Some(connection);
        self.connected = true;
    }

    /// Close and drop the connection handle.
    pub fn release_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.connected = false;
    }
}

impl Drop for ClientInstance {
    fn drop(&mut self) {
        self.release_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IedModel, SimEngine};
    use std::sync::Arc;

    fn noop_indication() -> ConnectionIndication {
        Arc::new(|_| {})
    }

    #[test]
    fn test_new_server_instance_defaults() {
        let inst = ServerInstance::create("ied1");
        assert_eq!(inst.port, 102);
        assert_eq!(inst.ip_address, "0.0.0.0");
        assert_eq!(inst.ied_name, "IED");
        assert!(!inst.has_model());
        assert!(!inst.engine_running());
    }

    #[test]
    fn test_release_engine_nils_every_handle() {
        let engine = SimEngine::new();
        let mut inst = ServerInstance::create("ied1");
        inst.install_model(engine.create_model(IedModel::new("Dev")));
        inst.ensure_engine_server(&engine, noop_indication()).unwrap();
        assert_eq!(inst.ied_name, "Dev");
        assert!(inst.has_engine_server());

        inst.engine_server_mut().unwrap().start(11102).unwrap();
        inst.running = true;
        assert_eq!(engine.running_servers(), 1);

        inst.release_engine();
        assert!(!inst.has_model());
        assert!(!inst.has_engine_server());
        assert!(!inst.running);
        assert_eq!(engine.running_servers(), 0);
    }

    #[test]
    fn test_stop_keeps_handles() {
        let engine = SimEngine::new();
        let mut inst = ServerInstance::create("ied1");
        inst.install_model(engine.create_model(IedModel::new("Dev")));
        inst.ensure_engine_server(&engine, noop_indication()).unwrap();
        inst.engine_server_mut().unwrap().start(11103).unwrap();

        inst.stop();
        assert!(inst.has_model());
        assert!(inst.has_engine_server());
        assert!(!inst.engine_running());
    }

    #[test]
    fn test_ensure_engine_server_without_model_is_noop() {
        let engine = SimEngine::new();
        let mut inst = ServerInstance::create("ied1");
        inst.ensure_engine_server(&engine, noop_indication()).unwrap();
        assert!(!inst.has_engine_server());
    }

    #[test]
    fn test_client_connection_hidden_when_disconnected() {
        let inst = ClientInstance::create("c1");
        assert!(inst.connection().is_none());
        assert_eq!(inst.target_port, 102);
    }
}
