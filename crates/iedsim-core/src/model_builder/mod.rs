//! Device-model construction from a nested document.
//!
//! The document mirrors what the GUI sends in `server.load_model`:
//!
//! ```text
//! { name, logical_devices: { LD: { logical_nodes: { LN: {
//!     data_objects: { DO: { cdc, attributes: { DA: { type, fc, value } } } },
//!     data_sets, report_controls, gse_controls, smv_controls, log_controls,
//!     setting_group_control } } } },
//!   communication: { gse: [...], smv: [...] } }
//! ```
//!
//! Only a non-map root is an error. Everything below it is parsed leniently:
//! a field that cannot be used is skipped, logged, and reported back as a
//! [`BuildWarning`].

mod controls;

use crate::actions::ActionError;
use crate::document::Document;
use crate::engine::model::trigger;
use crate::engine::{AttributeType, FunctionalConstraint, IedModel, MmsValue, NodeId};
use std::fmt;
use tracing::{debug, warn};

const DEFAULT_IED_NAME: &str = "IED";

/// A field the builder skipped or adjusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildWarning {
    /// Where in the model the problem was found, e.g. `PROT/XCBR1.Pos.stVal`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuiltModel {
    pub model: IedModel,
    pub ied_name: String,
    pub warnings: Vec<BuildWarning>,
}

/// Build a device model from `doc`.
pub fn build(doc: &Document, instance_id: &str) -> Result<BuiltModel, ActionError> {
    if !doc.is_map() {
        return Err(ActionError::Validation(
            "model payload is required".to_string(),
        ));
    }

    let mut builder = ModelBuilder::new(instance_id, doc);
    builder.build_tree(doc);
    builder.build_controls();
    if let Some(communication) = doc.field("communication") {
        builder.apply_communication(communication);
    }

    let ModelBuilder {
        model, warnings, ..
    } = builder;
    debug!(
        "Built model {} for {} ({} nodes, {} warnings)",
        model.name(),
        instance_id,
        model.node_count(),
        warnings.len()
    );
    Ok(BuiltModel {
        ied_name: model.name().to_string(),
        model,
        warnings,
    })
}

/// Logical node awaiting the control-block pass.
struct PendingNode<'d> {
    ld_name: String,
    ln: NodeId,
    ln_name: String,
    doc: &'d Document,
}

pub(crate) struct ModelBuilder<'d> {
    instance_id: String,
    model: IedModel,
    warnings: Vec<BuildWarning>,
    pending: Vec<PendingNode<'d>>,
    /// `(ld, cb name, index)` of every GOOSE control block.
    gse_blocks: Vec<(String, String, usize)>,
    /// `(ld, cb name, index)` of every sampled-value control block.
    sv_blocks: Vec<(String, String, usize)>,
}

impl<'d> ModelBuilder<'d> {
    fn new(instance_id: &str, doc: &Document) -> Self {
        let name = match doc.field("name") {
            Some(Document::String(name)) if !name.is_empty() => name.clone(),
            _ => DEFAULT_IED_NAME.to_string(),
        };
        Self {
            instance_id: instance_id.to_string(),
            model: IedModel::new(name),
            warnings: Vec::new(),
            pending: Vec::new(),
            gse_blocks: Vec::new(),
            sv_blocks: Vec::new(),
        }
    }

    pub(crate) fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        let warning = BuildWarning {
            path: path.into(),
            message: message.into(),
        };
        warn!("Model for {}: {}", self.instance_id, warning);
        self.warnings.push(warning);
    }

    /// Map entries of `key` in `doc`. A missing or nil section yields nothing;
    /// any other non-map is reported.
    fn section<'a>(
        &mut self,
        doc: &'a Document,
        key: &str,
        path: &str,
    ) -> Vec<(&'a String, &'a Document)> {
        match doc.field(key) {
            None => Vec::new(),
            Some(Document::Map(map)) => map.iter().collect(),
            Some(other) => {
                self.warn(
                    path,
                    format!("'{}' must be a map, got {}", key, other.kind()),
                );
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Tree pass
    // ========================================================================

    fn build_tree(&mut self, doc: &'d Document) {
        let root = self.model.name().to_string();
        for (ld_name, ld_doc) in self.section(doc, "logical_devices", &root) {
            let ld = self.model.create_logical_device(ld_name);
            for (ln_name, ln_doc) in self.section(ld_doc, "logical_nodes", ld_name) {
                let ln = self.model.create_logical_node(ld, ln_name);
                let ln_path = format!("{}/{}", ld_name, ln_name);
                for (do_name, do_doc) in self.section(ln_doc, "data_objects", &ln_path) {
                    let do_path = format!("{}.{}", ln_path, do_name);
                    self.build_data_object(ln, do_name, do_doc, &do_path);
                }
                self.pending.push(PendingNode {
                    ld_name: ld_name.clone(),
                    ln,
                    ln_name: ln_name.clone(),
                    doc: ln_doc,
                });
            }
        }
    }

    fn build_data_object(&mut self, parent: NodeId, name: &str, doc: &Document, path: &str) {
        let cdc = doc.str_field("cdc").filter(|cdc| !cdc.is_empty());
        let data_object = self.model.create_data_object(parent, name, cdc);

        for (child_name, child) in self.section(doc, "data_objects", path) {
            let child_path = format!("{}.{}", path, child_name);
            self.build_data_object(data_object, child_name, child, &child_path);
        }
        for (child_name, child) in self.section(doc, "attributes", path) {
            let child_path = format!("{}.{}", path, child_name);
            if child.field("cdc").is_some() && child.field("type").is_none() {
                self.build_data_object(data_object, child_name, child, &child_path);
            } else {
                self.build_attribute(data_object, child_name, child, &child_path);
            }
        }
    }

    fn build_attribute(&mut self, parent: NodeId, name: &str, doc: &Document, path: &str) {
        if !doc.is_map() {
            self.warn(path, format!("attribute must be a map, got {}", doc.kind()));
            return;
        }

        let fc = match doc.str_field("fc") {
            None => FunctionalConstraint::FALLBACK,
            Some(text) => FunctionalConstraint::parse(text).unwrap_or_else(|| {
                self.warn(
                    path,
                    format!("unknown functional constraint '{}', using ST", text),
                );
                FunctionalConstraint::FALLBACK
            }),
        };
        let trigger_options = match doc.field("trigger_options") {
            Some(options) => self.trigger_bits(options, path),
            None => 0,
        };

        if let Some(Document::Map(children)) = doc.field("attributes") {
            let node = self.model.create_data_attribute(
                parent,
                name,
                AttributeType::Constructed,
                fc,
                trigger_options,
            );
            for (child_name, child) in children {
                let child_path = format!("{}.{}", path, child_name);
                self.build_attribute(node, child_name, child, &child_path);
            }
            return;
        }

        let attr_type = match doc.str_field("type") {
            None => AttributeType::FALLBACK,
            Some(text) => AttributeType::parse(text).unwrap_or_else(|| {
                self.warn(
                    path,
                    format!("unknown attribute type '{}', using VisString255", text),
                );
                AttributeType::FALLBACK
            }),
        };
        let node = self
            .model
            .create_data_attribute(parent, name, attr_type, fc, trigger_options);

        let Some(value) = doc.field("value") else {
            return;
        };
        if attr_type == AttributeType::Constructed {
            self.warn(path, "value ignored on a constructed attribute");
            return;
        }
        match MmsValue::from_document(value, attr_type) {
            Some(mms) => {
                self.model.set_value(node, mms);
            }
            None => self.warn(
                path,
                format!("{} value does not fit type {}", value.kind(), attr_type),
            ),
        }
    }

    /// Trigger bits from an integer mask or a map of named flags.
    pub(crate) fn trigger_bits(&mut self, doc: &Document, path: &str) -> u8 {
        let bits = self.flag_bits(doc, path, TRIGGER_FLAGS);
        u8::try_from(bits).unwrap_or_else(|_| {
            self.warn(path, format!("trigger mask {} out of range", bits));
            0
        })
    }

    /// Bits from an integer mask or a `{flag: bool}` map. Unknown flag names
    /// are reported. `extra` names are accepted without contributing bits.
    pub(crate) fn flag_bits_with(
        &mut self,
        doc: &Document,
        path: &str,
        flags: &[(&str, u16)],
        extra: &[(&str, u16)],
    ) -> u16 {
        match doc {
            Document::Integer(mask) => match u16::try_from(*mask) {
                Ok(mask) => mask,
                Err(_) => {
                    self.warn(path, format!("option mask {} out of range", mask));
                    0
                }
            },
            Document::Map(map) => {
                let mut bits = 0;
                for (key, enabled) in map {
                    if let Some((_, bit)) = flags.iter().find(|(name, _)| name == key) {
                        if enabled.as_bool().unwrap_or(false) {
                            bits |= bit;
                        }
                    } else if !extra.iter().any(|(name, _)| name == key) {
                        self.warn(path, format!("unknown option '{}'", key));
                    }
                }
                bits
            }
            other => {
                self.warn(
                    path,
                    format!("options must be a map or integer, got {}", other.kind()),
                );
                0
            }
        }
    }

    pub(crate) fn flag_bits(&mut self, doc: &Document, path: &str, flags: &[(&str, u16)]) -> u16 {
        self.flag_bits_with(doc, path, flags, &[])
    }
}

pub(crate) const TRIGGER_FLAGS: &[(&str, u16)] = &[
    ("data_change", trigger::DATA_CHANGED as u16),
    ("dchg", trigger::DATA_CHANGED as u16),
    ("quality_change", trigger::QUALITY_CHANGED as u16),
    ("qchg", trigger::QUALITY_CHANGED as u16),
    ("data_update", trigger::DATA_UPDATE as u16),
    ("dupd", trigger::DATA_UPDATE as u16),
    ("integrity", trigger::INTEGRITY as u16),
    ("period", trigger::INTEGRITY as u16),
    ("gi", trigger::GI as u16),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NodeKind;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    fn breaker_doc() -> Document {
        doc(json!({
            "name": "SimIED",
            "logical_devices": {
                "PROT": {
                    "logical_nodes": {
                        "XCBR1": {
                            "class": "XCBR",
                            "data_objects": {
                                "Pos": {
                                    "cdc": "DPC",
                                    "attributes": {
                                        "stVal": {"type": "BOOLEAN", "fc": "ST", "value": true},
                                        "q": {"type": "Quality", "fc": "ST", "value": 0},
                                        "t": {"type": "Timestamp", "fc": "ST", "value": null},
                                        "ctlModel": {"type": "Enum", "fc": "CF", "value": 1}
                                    }
                                },
                                "A": {
                                    "cdc": "WYE",
                                    "attributes": {
                                        "phsA": {
                                            "cdc": "CMV",
                                            "attributes": {
                                                "cVal": {
                                                    "type": "Struct",
                                                    "fc": "MX",
                                                    "attributes": {
                                                        "mag": {
                                                            "type": "Struct",
                                                            "fc": "MX",
                                                            "attributes": {
                                                                "f": {"type": "FLOAT32", "fc": "MX", "value": 1.5}
                                                            }
                                                        }
                                                    }
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }))
    }

    #[test]
    fn test_non_map_root_is_rejected() {
        let err = build(&Document::from("nope"), "x").unwrap_err();
        assert_eq!(err.to_string(), "model payload is required");
    }

    #[test]
    fn test_empty_map_yields_default_device() {
        let built = build(&Document::empty_map(), "x").unwrap();
        assert_eq!(built.ied_name, "IED");
        assert_eq!(built.model.logical_devices().count(), 0);
        assert!(built.warnings.is_empty());
    }

    #[test]
    fn test_tree_and_values() {
        let built = build(&breaker_doc(), "x").unwrap();
        assert!(built.warnings.is_empty(), "{:?}", built.warnings);
        assert_eq!(built.ied_name, "SimIED");

        let model = &built.model;
        let st_val = model.find_by_reference("PROT/XCBR1.Pos.stVal").unwrap();
        assert_eq!(
            model.attribute(st_val).unwrap().value,
            Some(MmsValue::Boolean(true))
        );
        let t = model.find_by_reference("PROT/XCBR1.Pos.t").unwrap();
        assert_eq!(model.attribute(t).unwrap().value, None);

        let pos = model.find_by_reference("PROT/XCBR1.Pos").unwrap();
        assert_eq!(
            model.node(pos).kind,
            NodeKind::DataObject {
                cdc: Some("DPC".to_string())
            }
        );
    }

    #[test]
    fn test_nested_data_object_and_constructed_attribute() {
        let built = build(&breaker_doc(), "x").unwrap();
        let model = &built.model;

        let phs_a = model.find_by_reference("PROT/XCBR1.A.phsA").unwrap();
        assert!(matches!(model.node(phs_a).kind, NodeKind::DataObject { .. }));

        let mag = model.find_by_reference("PROT/XCBR1.A.phsA.cVal.mag").unwrap();
        assert_eq!(
            model.attribute(mag).unwrap().attr_type,
            AttributeType::Constructed
        );
        let f = model
            .find_by_reference("PROT/XCBR1.A.phsA.cVal.mag.f")
            .unwrap();
        assert_eq!(
            model.attribute(f).unwrap().value,
            Some(MmsValue::Float(1.5))
        );
    }

    #[test]
    fn test_lenient_fields_become_warnings() {
        let built = build(
            &doc(json!({
                "logical_devices": {
                    "LD0": {
                        "logical_nodes": {
                            "GGIO1": {
                                "data_objects": {
                                    "Ind": {
                                        "attributes": {
                                            "stVal": {"type": "BOOLEAN", "fc": "ST", "value": "yes"},
                                            "odd": {"type": "NOPE", "fc": "ZZ"},
                                            "bad": 7
                                        }
                                    }
                                }
                            }
                        }
                    },
                    "LD1": {"logical_nodes": []}
                }
            })),
            "x",
        )
        .unwrap();

        let paths: Vec<&str> = built.warnings.iter().map(|w| w.path.as_str()).collect();
        assert!(paths.contains(&"LD0/GGIO1.Ind.stVal"));
        assert!(paths.contains(&"LD0/GGIO1.Ind.odd"));
        assert!(paths.contains(&"LD0/GGIO1.Ind.bad"));
        assert!(paths.contains(&"LD1"));

        let odd = built.model.find_by_reference("LD0/GGIO1.Ind.odd").unwrap();
        let attr = built.model.attribute(odd).unwrap();
        assert_eq!(attr.attr_type, AttributeType::VisString255);
        assert_eq!(attr.fc, FunctionalConstraint::ST);
        // The attribute survives without its value.
        let st_val = built.model.find_by_reference("LD0/GGIO1.Ind.stVal").unwrap();
        assert_eq!(built.model.attribute(st_val).unwrap().value, None);
    }

    #[test]
    fn test_trigger_options_accept_mask_and_map() {
        let built = build(
            &doc(json!({
                "logical_devices": {"LD0": {"logical_nodes": {"GGIO1": {"data_objects": {
                    "Ind": {"attributes": {
                        "stVal": {"type": "BOOLEAN", "trigger_options": 3},
                        "q": {"type": "Quality", "trigger_options": {"qchg": true, "gi": true, "dchg": false}}
                    }}
                }}}}}
            })),
            "x",
        )
        .unwrap();
        let model = &built.model;
        let st_val = model.find_by_reference("LD0/GGIO1.Ind.stVal").unwrap();
        assert_eq!(model.attribute(st_val).unwrap().trigger_options, 3);
        let q = model.find_by_reference("LD0/GGIO1.Ind.q").unwrap();
        assert_eq!(
            model.attribute(q).unwrap().trigger_options,
            trigger::QUALITY_CHANGED | trigger::GI
        );
    }

    #[test]
    fn test_oversized_trigger_mask_is_reported() {
        let built = build(
            &doc(json!({
                "logical_devices": {"LD0": {"logical_nodes": {"GGIO1": {"data_objects": {
                    "Ind": {"attributes": {
                        "stVal": {"type": "BOOLEAN", "trigger_options": 300}
                    }}
                }}}}}
            })),
            "x",
        )
        .unwrap();
        let warning = built
            .warnings
            .iter()
            .find(|w| w.path == "LD0/GGIO1.Ind.stVal")
            .unwrap();
        assert_eq!(warning.message, "trigger mask 300 out of range");
        let st_val = built.model.find_by_reference("LD0/GGIO1.Ind.stVal").unwrap();
        assert_eq!(built.model.attribute(st_val).unwrap().trigger_options, 0);
    }
}
