//! `client.*` actions: outbound associations to remote (or simulated) devices.

use super::params::{
    get_array_param, get_i64_param, get_map_param, get_port_param, get_str_param, reference_key,
    NON_STRING_REFERENCE,
};
use super::{ActionContext, ActionError, ActionHandler, ActionRegistry};
use crate::config::ClientDefaults;
use crate::context::ClientInstance;
use crate::document::Document;
use crate::engine::{ConnectOptions, ConnectionHandle, EngineConnection, MmsValue};
use tracing::{debug, info, warn};

const INVALID_REQUEST: &str = "Invalid request";
const NOT_CONNECTED: &str = "Client not connected";

pub fn register_client_actions(registry: &mut ActionRegistry) {
    registry.register(Box::new(Connect));
    registry.register(Box::new(Disconnect));
    registry.register(Box::new(Browse));
    registry.register(Box::new(Read));
    registry.register(Box::new(ReadBatch));
    registry.register(Box::new(Write));
    registry.register(Box::new(ListInstances));
}

fn connection<'s>(ctx: &'s ActionContext<'_>) -> Option<&'s ConnectionHandle> {
    ctx.state
        .clients
        .get(ctx.instance_id)
        .and_then(ClientInstance::connection)
}

/// Read one reference, trying each read FC in turn.
fn read_entry(conn: &dyn EngineConnection, reference: &str) -> Document {
    let mut last_error = String::from("Object does not exist");
    for fc in ClientDefaults::READ_FCS {
        match conn.read(reference, fc) {
            Ok(value) => return value_entry(value.to_document(), Document::Nil),
            Err(err) => {
                debug!("Read {} [{}] failed: {}", reference, fc, err);
                last_error = err.to_string();
            }
        }
    }
    value_entry(Document::Nil, Document::from(last_error))
}

fn value_entry(value: Document, error: Document) -> Document {
    [
        ("value", value),
        ("quality", Document::Integer(0)),
        ("timestamp", Document::Nil),
        ("error", error),
    ]
    .into_iter()
    .collect()
}

/// Logical-node class: the name without its prefix and instance number.
fn ln_class(name: &str) -> &str {
    if name.starts_with("LLN0") {
        return "LLN0";
    }
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    match stem.char_indices().rev().nth(3) {
        Some((start, _)) => &stem[start..],
        None => stem,
    }
}

struct Connect;

impl ActionHandler for Connect {
    fn name(&self) -> &'static str {
        "client.connect"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let id = ctx.instance_id;
        let host = get_str_param(ctx.payload, "host").filter(|host| !host.is_empty());
        let port = get_port_param(ctx.payload, "port")
            .map_err(|_| ActionError::validation(INVALID_REQUEST))?;
        let (Some(host), Some(port)) = (host, port) else {
            return Err(ActionError::validation(INVALID_REQUEST));
        };
        let timeout_ms = get_map_param(ctx.payload, "config")
            .and_then(|config| get_i64_param(config, "timeout_ms"))
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(ClientDefaults::REQUEST_TIMEOUT_MS);

        info!("client.connect requested for {} -> {}:{}", id, host, port);
        let inst = ctx.state.clients.get_or_create(id);
        inst.release_connection();
        inst.target_host = host.to_string();
        inst.target_port = port;
        inst.timeout_ms = timeout_ms;

        let options = ConnectOptions {
            connect_timeout_ms: timeout_ms,
            request_timeout_ms: timeout_ms,
        };
        match ctx.backend.engine().connect(host, port, &options) {
            Ok(connection) => {
                inst.attach(connection);
                info!("Client {} connected to {} ({}:{})", id, inst.ied_name, host, port);
                Ok([
                    ("success", Document::from(true)),
                    ("instance_id", Document::from(id)),
                ]
                .into_iter()
                .collect())
            }
            Err(err) => {
                warn!("Client {} failed to connect to {}:{}: {}", id, host, port, err);
                Err(err.into())
            }
        }
    }
}

struct Disconnect;

impl ActionHandler for Disconnect {
    fn name(&self) -> &'static str {
        "client.disconnect"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        if let Some(mut inst) = ctx.state.clients.remove(ctx.instance_id) {
            inst.release_connection();
            info!("Client {} disconnected", ctx.instance_id);
        }
        Ok([("success", true)].into_iter().collect())
    }
}

struct Browse;

impl Browse {
    fn logical_node(conn: &dyn EngineConnection, ld: &str, ln: &str) -> Document {
        let data_objects = conn.data_objects(ld, ln).unwrap_or_else(|err| {
            warn!("Browse {}/{} failed: {}", ld, ln, err);
            Vec::new()
        });
        let data_objects: Document = data_objects
            .into_iter()
            .map(|(name, cdc)| {
                let attributes: Document = conn
                    .data_directory(ld, ln, &name)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|attr| {
                        let entry: Document = [("name", attr.as_str())].into_iter().collect();
                        (attr, entry)
                    })
                    .collect();
                let entry: Document = [
                    ("cdc", Document::from(cdc.unwrap_or_default())),
                    ("description", Document::from("")),
                    ("attributes", attributes),
                ]
                .into_iter()
                .collect();
                (name, entry)
            })
            .collect();
        [
            ("class", Document::from(ln_class(ln))),
            ("description", Document::from("")),
            ("data_objects", data_objects),
        ]
        .into_iter()
        .collect()
    }
}

impl ActionHandler for Browse {
    fn name(&self) -> &'static str {
        "client.browse"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let conn = connection(ctx)
            .ok_or_else(|| ActionError::NotInitialized(NOT_CONNECTED.to_string()))?;
        let ied_name = ctx
            .state
            .clients
            .get(ctx.instance_id)
            .map(|inst| inst.ied_name.clone())
            .unwrap_or_default();

        let mut logical_devices = Document::empty_map();
        for ld in conn.logical_devices()? {
            let lns = conn.logical_nodes(&ld).unwrap_or_else(|err| {
                warn!("Browse {} failed: {}", ld, err);
                Vec::new()
            });
            let logical_nodes: Document = lns
                .iter()
                .map(|ln| (ln.as_str(), Self::logical_node(&**conn, &ld, ln)))
                .collect();
            let entry: Document = [
                ("description", Document::from("")),
                ("logical_nodes", logical_nodes),
            ]
            .into_iter()
            .collect();
            logical_devices.insert(ld, entry);
        }

        let model: Document = [
            ("ied_name", Document::from(ied_name)),
            ("logical_devices", logical_devices),
        ]
        .into_iter()
        .collect();
        Ok([("model", model)].into_iter().collect())
    }
}

struct Read;

impl ActionHandler for Read {
    fn name(&self) -> &'static str {
        "client.read"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let reference = get_str_param(ctx.payload, "reference");
        let (Some(conn), Some(reference)) = (connection(ctx), reference) else {
            return Err(ActionError::validation(INVALID_REQUEST));
        };
        let entry = read_entry(&**conn, reference);
        Ok([("value", entry)].into_iter().collect())
    }
}

struct ReadBatch;

impl ActionHandler for ReadBatch {
    fn name(&self) -> &'static str {
        "client.read_batch"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let references = get_array_param(ctx.payload, "references");
        let (Some(conn), Some(references)) = (connection(ctx), references) else {
            return Err(ActionError::validation(INVALID_REQUEST));
        };
        let values: Document = references
            .iter()
            .enumerate()
            .map(|(index, reference)| match reference_key(index, reference) {
                Ok(reference) => (reference.to_string(), read_entry(&**conn, reference)),
                Err(key) => (
                    key,
                    value_entry(Document::Nil, Document::from(NON_STRING_REFERENCE)),
                ),
            })
            .collect();
        Ok([("values", values)].into_iter().collect())
    }
}

struct Write;

impl ActionHandler for Write {
    fn name(&self) -> &'static str {
        "client.write"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let reference = get_str_param(ctx.payload, "reference");
        let value = ctx.payload.field("value");
        let (Some(conn), Some(reference), Some(value)) = (connection(ctx), reference, value)
        else {
            return Err(ActionError::validation(INVALID_REQUEST));
        };
        let value = MmsValue::from_untyped(value).ok_or_else(|| {
            ActionError::validation(format!("Unsupported value type: {}", value.kind()))
        })?;

        let mut last_error = None;
        for fc in ClientDefaults::WRITE_FCS {
            match conn.write(reference, fc, &value) {
                Ok(()) => {
                    debug!("Wrote {} [{}]", reference, fc);
                    return Ok([("success", true)].into_iter().collect());
                }
                Err(err) => last_error = Some(err),
            }
        }
        let message = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "Write failed".to_string());
        warn!("Write {} failed: {}", reference, message);
        Err(ActionError::Engine(message))
    }
}

struct ListInstances;

impl ActionHandler for ListInstances {
    fn name(&self) -> &'static str {
        "client.list_instances"
    }

    fn requires_payload(&self) -> bool {
        false
    }

    fn requires_instance_id(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut ActionContext<'_>) -> Result<Document, ActionError> {
        let instances: Vec<Document> = ctx
            .state
            .clients
            .iter()
            .map(|(id, inst)| {
                [
                    ("instance_id", Document::from(id)),
                    (
                        "state",
                        Document::from(if inst.connected {
                            "CONNECTED"
                        } else {
                            "DISCONNECTED"
                        }),
                    ),
                    ("target_host", Document::from(inst.target_host.as_str())),
                    ("target_port", Document::from(inst.target_port)),
                ]
                .into_iter()
                .collect()
            })
            .collect();
        Ok([("instances", instances)].into_iter().collect())
    }
}
