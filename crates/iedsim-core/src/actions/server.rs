//! `server.*` actions: simulated device servers.

use super::params::{
    get_array_param, get_i64_param, get_map_param, get_port_param, get_str_param, reference_key,
    NON_STRING_REFERENCE,
};
use super::{ActionContext, ActionError, ActionHandler, ActionRegistry};
use crate::config::NetworkDefaults;
use crate::context::{InterfaceSelection, ServerInstance};
use crate::document::Document;
use crate::engine::{AttributeType, MmsValue, NodeKind};
use crate::model_builder;
use crate::network::{address_label, should_configure_ip};
use chrono::SecondsFormat;
use tracing::{debug, info, warn};

const NOT_INITIALIZED: &str = "Server not initialized. Call server.load_model first";
const INVALID_SET_VALUE: &str = "Invalid request: missing server, model, reference, or value";
const INVALID_GET_VALUES: &str = "Invalid request: missing server, model, or references array";

pub fn register_server_actions(registry: &mut ActionRegistry) {
    registry.register(Box::new(LoadModel));
    registry.register(Box::new(Start));
    registry.register(Box::new(Stop));
    registry.register(Box::new(Remove));
    registry.register(Box::new(SetDataValue));
    registry.register(Box::new(GetValues));
    registry.register(Box::new(GetClients));
    registry.register(Box::new(ListInstances));
    registry.register(Box::new(GetInterfaces));
    registry.register(Box::new(SetInterface));
}

fn success(instance_id: Option<&str>) -> Document {
    let mut payload: Document = [("success", true)].into_iter().collect();
    if let Some(id) = instance_id {
        payload.insert("instance_id", id);
    }
    payload
}

/// Connection settings from a `config` map. Absent fields stay `None`.
#[derive(Debug, Default)]
struct ServerSettings {
    ied_name: Option<String>,
    port: Option<u16>,
    ip_address: Option<String>,
    max_connections: Option<u32>,
}

impl ServerSettings {
    fn parse(payload: &Document) -> Result<Self, ActionError> {
        let Some(config) = get_map_param(payload, "config") else {
            return Ok(Self::default());
        };
        let max_connections = match config.field("max_connections") {
            None => None,
            Some(_) => Some(
                get_i64_param(config, "max_connections")
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ActionError::validation("Invalid max_connections"))?,
            ),
        };
        Ok(Self {
            ied_name: get_str_param(config, "ied_name")
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            port: get_port_param(config, "port")?,
            ip_address: get_str_param(config, "ip_address")
                .filter(|ip| !ip.is_empty())
                .map(str::to_string),
            max_connections,
        })
    }

    fn apply(self, inst: &mut ServerInstance) {
        if let Some(port) = self.port {
            inst.port = port;
        }
        if let Some(ip) = self.ip_address {
            inst.ip_address = ip;
        }
        if let Some(max) = self.max_connections {
            inst.max_connections = max;
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

struct LoadModel;

impl ActionHandler for LoadModel {
    fn name(&self) -> &'static str {
        "server.load_model"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let id = ctx.instance_id;
        let backend = ctx.backend;
        info!("server.load_model requested for instance {}", id);

        let model_doc = ctx
            .payload
            .field("model")
            .ok_or_else(|| ActionError::validation("model payload is required"))?;
        let settings = ServerSettings::parse(ctx.payload)?;
        let built = model_builder::build(model_doc, id)?;

        let inst = ctx.state.servers.get_or_create(id);
        let display_name = settings.ied_name.clone();
        settings.apply(inst);

        inst.install_model(backend.engine().create_model(built.model));
        if let Some(name) = display_name {
            inst.ied_name = name;
        }
        inst.ensure_engine_server(backend.engine(), backend.connection_indication(id))?;
        let ip = inst.ip_address.clone();
        if let Some(server) = inst.engine_server_mut() {
            server.set_local_address(&ip);
        }

        info!(
            "Server instance {} loaded model ({}), ready to start on {}:{}",
            id, inst.ied_name, inst.ip_address, inst.port
        );

        let mut payload = success(Some(id));
        if !built.warnings.is_empty() {
            let warnings: Vec<Document> = built
                .warnings
                .iter()
                .map(|w| Document::from(w.to_string()))
                .collect();
            payload.insert("warnings", warnings);
        }
        Ok(payload)
    }
}

struct Start;

impl ActionHandler for Start {
    fn name(&self) -> &'static str {
        "server.start"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let id = ctx.instance_id;
        let backend = ctx.backend;
        info!("server.start requested for instance {}", id);

        let settings = ServerSettings::parse(ctx.payload)?;
        let interface = ctx.state.interface.clone();
        let inst = ctx
            .state
            .servers
            .get_mut(id)
            .filter(|inst| inst.has_model())
            .ok_or_else(|| ActionError::NotInitialized(NOT_INITIALIZED.to_string()))?;

        inst.ensure_engine_server(backend.engine(), backend.connection_indication(id))?;
        if inst.engine_running() {
            inst.stop();
        }
        inst.running = false;
        settings.apply(inst);

        if let Some(selection) = interface.filter(|_| should_configure_ip(&inst.ip_address)) {
            let label = address_label(&selection.name, id);
            match backend.network().add_address(
                &selection.name,
                &inst.ip_address,
                selection.prefix_len,
                Some(&label),
            ) {
                Ok(()) => {
                    inst.ip_configured = true;
                    info!("Configured IP {} on {}", inst.ip_address, selection.name);
                }
                Err(err) => warn!(
                    "Failed to configure IP {} on {}: {}",
                    inst.ip_address, selection.name, err
                ),
            }
        }

        let (port, ip) = (inst.port, inst.ip_address.clone());
        let Some(server) = inst.engine_server_mut() else {
            return Err(ActionError::NotInitialized(NOT_INITIALIZED.to_string()));
        };
        server.set_local_address(&ip);
        server.start(port)?;
        inst.running = inst.engine_running();

        info!("Server instance {} started on {}:{}", id, ip, port);
        Ok([
            ("success", Document::from(inst.running)),
            ("instance_id", Document::from(id)),
        ]
        .into_iter()
        .collect())
    }
}

struct Stop;

impl ActionHandler for Stop {
    fn name(&self) -> &'static str {
        "server.stop"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        info!("server.stop requested for instance {}", ctx.instance_id);
        if let Some(inst) = ctx.state.servers.get_mut(ctx.instance_id) {
            if inst.running || inst.engine_running() {
                inst.stop();
                info!("Server instance {} stopped", ctx.instance_id);
            }
        }
        Ok(success(None))
    }
}

struct Remove;

impl ActionHandler for Remove {
    fn name(&self) -> &'static str {
        "server.remove"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let id = ctx.instance_id;
        info!("server.remove requested for instance {}", id);

        let Some(mut inst) = ctx.state.servers.remove(id) else {
            return Ok(success(None));
        };
        if inst.ip_configured {
            if let Some(selection) = &ctx.state.interface {
                match ctx.backend.network().remove_address(
                    &selection.name,
                    &inst.ip_address,
                    selection.prefix_len,
                ) {
                    Ok(()) => info!(
                        "Cleaned up IP {} from {}",
                        inst.ip_address, selection.name
                    ),
                    Err(err) => warn!(
                        "Failed to remove IP {} from {}: {}",
                        inst.ip_address, selection.name, err
                    ),
                }
            }
            inst.ip_configured = false;
        }
        inst.release_engine();
        inst.clients.clear();
        info!("Server instance {} removed", id);
        Ok(success(None))
    }
}

// ============================================================================
// Data access
// ============================================================================

struct SetDataValue;

impl ActionHandler for SetDataValue {
    fn name(&self) -> &'static str {
        "server.set_data_value"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let reference = get_str_param(ctx.payload, "reference");
        let value = ctx.payload.field("value");
        let inst = ctx
            .state
            .servers
            .get(ctx.instance_id)
            .filter(|inst| inst.has_engine_server());
        let (Some(inst), Some(reference), Some(value)) = (inst, reference, value) else {
            return Err(ActionError::validation(INVALID_SET_VALUE));
        };
        let Some(handle) = inst.model() else {
            return Err(ActionError::validation(INVALID_SET_VALUE));
        };

        debug!("Update value: {}", reference);
        let mut model = handle.lock();
        let Some(node) = model.find_by_reference(reference) else {
            warn!(
                "server.set_data_value: {} not found in {}",
                reference, ctx.instance_id
            );
            return Ok(success(None));
        };
        let attr_type = match model.attribute(node) {
            Some(attr) if attr.attr_type != AttributeType::Constructed => attr.attr_type,
            _ => {
                warn!(
                    "server.set_data_value: {} is not a leaf attribute",
                    reference
                );
                return Ok(success(None));
            }
        };
        let mms = MmsValue::from_document(value, attr_type).ok_or_else(|| {
            ActionError::validation(format!(
                "Value for {} does not match type {}",
                reference, attr_type
            ))
        })?;
        model.set_value(node, mms);
        Ok(success(None))
    }
}

/// `{value, quality, timestamp}` plus `error` when the lookup failed.
fn value_entry(value: Document, timestamp: Document, error: Option<&str>) -> Document {
    let mut entry: Document = [
        ("value", value),
        ("quality", Document::Integer(0)),
        ("timestamp", timestamp),
    ]
    .into_iter()
    .collect();
    if let Some(message) = error {
        entry.insert("error", message);
    }
    entry
}

struct GetValues;

impl ActionHandler for GetValues {
    fn name(&self) -> &'static str {
        "server.get_values"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let references = get_array_param(ctx.payload, "references");
        let inst = ctx
            .state
            .servers
            .get(ctx.instance_id)
            .filter(|inst| inst.has_engine_server());
        let (Some(inst), Some(references)) = (inst, references) else {
            return Err(ActionError::validation(INVALID_GET_VALUES));
        };
        let Some(handle) = inst.model() else {
            return Err(ActionError::validation(INVALID_GET_VALUES));
        };

        let model = handle.lock();
        let mut values = Document::empty_map();
        for (index, reference) in references.iter().enumerate() {
            let reference = match reference_key(index, reference) {
                Ok(reference) => reference,
                Err(key) => {
                    warn!("server.get_values: reference {} is not a string", key);
                    values.insert(
                        key,
                        value_entry(Document::Nil, Document::Nil, Some(NON_STRING_REFERENCE)),
                    );
                    continue;
                }
            };
            let entry = match model.find_by_reference(reference) {
                None => value_entry(Document::Nil, Document::Nil, Some("Object does not exist")),
                Some(node) => match &model.node(node).kind {
                    NodeKind::DataAttribute(attr) => value_entry(
                        attr.value
                            .as_ref()
                            .map(MmsValue::to_document)
                            .unwrap_or_default(),
                        attr.updated_at
                            .map(|at| {
                                Document::from(at.to_rfc3339_opts(SecondsFormat::Millis, true))
                            })
                            .unwrap_or_default(),
                        None,
                    ),
                    _ => value_entry(Document::Nil, Document::Nil, None),
                },
            };
            values.insert(reference, entry);
        }
        Ok([("values", values)].into_iter().collect())
    }
}

struct GetClients;

impl ActionHandler for GetClients {
    fn name(&self) -> &'static str {
        "server.get_clients"
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        debug!("server.get_clients requested for instance {}", ctx.instance_id);
        let clients: Vec<Document> = ctx
            .state
            .servers
            .get(ctx.instance_id)
            .map(|inst| {
                inst.clients
                    .iter()
                    .map(|client| {
                        [
                            ("id", client.id.as_str()),
                            ("connected_at", client.connected_at.as_str()),
                        ]
                        .into_iter()
                        .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok([("clients", clients)].into_iter().collect())
    }
}

// ============================================================================
// Registry and host interface
// ============================================================================

struct ListInstances;

impl ActionHandler for ListInstances {
    fn name(&self) -> &'static str {
        "server.list_instances"
    }

    fn requires_instance_id(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        debug!("server.list_instances requested");
        let instances: Vec<Document> = ctx
            .state
            .servers
            .iter()
            .map(|(id, inst)| {
                [
                    ("instance_id", Document::from(id)),
                    (
                        "state",
                        Document::from(if inst.running { "RUNNING" } else { "STOPPED" }),
                    ),
                    ("port", Document::from(inst.port)),
                    ("ied_name", Document::from(inst.ied_name.as_str())),
                ]
                .into_iter()
                .collect()
            })
            .collect();
        Ok([("instances", instances)].into_iter().collect())
    }
}

struct GetInterfaces;

impl ActionHandler for GetInterfaces {
    fn name(&self) -> &'static str {
        "server.get_interfaces"
    }

    fn requires_instance_id(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        info!("server.get_interfaces requested");
        let interfaces = ctx
            .backend
            .network()
            .list_interfaces()
            .map_err(|err| ActionError::Engine(err.to_string()))?;

        let interfaces: Vec<Document> = interfaces
            .into_iter()
            .map(|iface| {
                [
                    ("name", Document::from(iface.name)),
                    ("description", Document::from(iface.description)),
                    ("is_up", Document::from(iface.is_up)),
                    ("addresses", Document::from(iface.addresses)),
                ]
                .into_iter()
                .collect()
            })
            .collect();
        let current = match &ctx.state.interface {
            Some(selection) => [
                ("name", Document::from(selection.name.as_str())),
                ("prefix_len", Document::from(selection.prefix_len)),
            ]
            .into_iter()
            .collect(),
            None => Document::Nil,
        };
        Ok([
            ("interfaces", Document::from(interfaces)),
            ("current_interface", current),
        ]
        .into_iter()
        .collect())
    }
}

struct SetInterface;

impl ActionHandler for SetInterface {
    fn name(&self) -> &'static str {
        "server.set_interface"
    }

    fn requires_instance_id(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        info!("server.set_interface requested");
        let name = get_str_param(ctx.payload, "interface_name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ActionError::validation("interface_name is required"))?;
        let prefix_len = match ctx.payload.field("prefix_len") {
            None => NetworkDefaults::PREFIX_LEN,
            Some(_) => get_i64_param(ctx.payload, "prefix_len")
                .and_then(|len| u8::try_from(len).ok())
                .filter(|len| *len <= 32)
                .ok_or_else(|| ActionError::validation("Invalid prefix_len"))?,
        };

        ctx.state.interface = Some(InterfaceSelection {
            name: name.to_string(),
            prefix_len,
        });
        info!(
            "Global interface set to: {} (prefix_len: {})",
            name, prefix_len
        );
        Ok([
            ("interface_name", Document::from(name)),
            ("prefix_len", Document::from(prefix_len)),
        ]
        .into_iter()
        .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_entry_shape() {
        let ok = value_entry(Document::Bool(true), Document::Nil, None);
        assert_eq!(ok.get("value"), Some(&Document::Bool(true)));
        assert_eq!(ok.get("quality"), Some(&Document::Integer(0)));
        assert_eq!(ok.get("timestamp"), Some(&Document::Nil));
        assert!(ok.get("error").is_none());

        let missing = value_entry(Document::Nil, Document::Nil, Some("Object does not exist"));
        assert_eq!(missing.str_field("error"), Some("Object does not exist"));
    }

    #[test]
    fn test_settings_parse() {
        let payload: Document = serde_json::from_value(serde_json::json!({
            "config": {"port": 10102, "ip_address": "", "max_connections": 3}
        }))
        .unwrap();
        let settings = ServerSettings::parse(&payload).unwrap();
        assert_eq!(settings.port, Some(10102));
        assert_eq!(settings.ip_address, None);
        assert_eq!(settings.max_connections, Some(3));

        let bad: Document = serde_json::from_value(serde_json::json!({
            "config": {"max_connections": 0}
        }))
        .unwrap();
        assert!(ServerSettings::parse(&bad).is_err());
    }
}
