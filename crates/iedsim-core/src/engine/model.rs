//! Addressable device-model tree.
//!
//! The tree is an arena of [`ModelNode`]s indexed by [`NodeId`]. Node kinds
//! are an explicit tagged enum, so walking the tree never has to guess what
//! a node is. Datasets and control blocks hang off logical nodes and are kept
//! in flat lists, the way the engine's dynamic-model API exposes them.

use super::types::{AttributeType, FunctionalConstraint};
use super::value::MmsValue;
use chrono::{DateTime, Utc};

/// Index of a node within an [`IedModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Kind of a tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Device,
    LogicalDevice,
    LogicalNode,
    DataObject { cdc: Option<String> },
    DataAttribute(DataAttribute),
}

/// Payload of a data-attribute node.
#[derive(Debug, Clone, PartialEq)]
pub struct DataAttribute {
    pub attr_type: AttributeType,
    pub fc: FunctionalConstraint,
    pub trigger_options: u8,
    pub value: Option<MmsValue>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

/// Trigger option bits shared by report and log control blocks.
pub mod trigger {
    pub const DATA_CHANGED: u8 = 1;
    pub const QUALITY_CHANGED: u8 = 2;
    pub const DATA_UPDATE: u8 = 4;
    pub const INTEGRITY: u8 = 8;
    pub const GI: u8 = 16;
}

/// Optional report fields.
pub mod report_options {
    pub const SEQ_NUM: u16 = 1;
    pub const TIME_STAMP: u16 = 2;
    pub const REASON_FOR_INCLUSION: u16 = 4;
    pub const DATA_SET: u16 = 8;
    pub const DATA_REFERENCE: u16 = 16;
    pub const BUFFER_OVERFLOW: u16 = 32;
    pub const ENTRY_ID: u16 = 64;
    pub const CONF_REV: u16 = 128;
    pub const SEGMENTATION: u16 = 256;
}

pub mod goose_options {
    pub const FIXED_OFFS: u8 = 1;
    pub const NEEDS_COMMISSIONING: u8 = 2;
    pub const TEST: u8 = 4;
}

pub mod sv_options {
    pub const REFRESH_TIME: u8 = 1;
    pub const SAMPLE_SYNC: u8 = 2;
    pub const SAMPLE_RATE: u8 = 4;
    pub const DATA_SET: u8 = 8;
    pub const SECURITY: u8 = 16;
}

/// One dataset member, e.g. `GenericIO/GGIO1.SPCSO1.stVal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetEntry {
    pub logical_device: String,
    /// `LN.DO` part of the reference.
    pub variable: String,
    pub index: Option<u32>,
    /// Attribute path below the data object; `None` for DO-level members.
    pub component: Option<String>,
}

impl DataSetEntry {
    /// Full reference string. DO-level members keep their trailing dot.
    pub fn reference(&self) -> String {
        let mut out = format!("{}/{}", self.logical_device, self.variable);
        if let Some(index) = self.index {
            out.push_str(&format!("[{}]", index));
        }
        out.push('.');
        if let Some(component) = &self.component {
            out.push_str(component);
        }
        out
    }

    /// Reference without the trailing dot of DO-level members.
    pub fn object_reference(&self) -> String {
        self.reference().trim_end_matches('.').to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    pub name: String,
    pub parent: NodeId,
    pub entries: Vec<DataSetEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportControlBlock {
    pub name: String,
    pub parent: NodeId,
    pub rpt_id: Option<String>,
    pub buffered: bool,
    pub data_set: Option<String>,
    pub conf_rev: u32,
    pub trigger_options: u8,
    pub options: u16,
    pub buf_time: u32,
    pub intg_pd: u32,
}

/// Layer-2 addressing of a GOOSE or SV publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyComAddress {
    pub vlan_priority: u8,
    pub vlan_id: u16,
    pub app_id: u16,
    pub dst_address: [u8; 6],
}

#[derive(Debug, Clone, PartialEq)]
pub struct GseControlBlock {
    pub name: String,
    pub parent: NodeId,
    pub app_id: String,
    pub data_set: Option<String>,
    pub conf_rev: u32,
    pub min_time: u32,
    pub max_time: u32,
    pub options: u8,
    pub address: Option<PhyComAddress>,
}

/// Sampling mode of a sampled-value control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    SamplesPerPeriod,
    SamplesPerSecond,
    SecondsPerSample,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SvControlBlock {
    pub name: String,
    pub parent: NodeId,
    pub sv_id: String,
    pub data_set: Option<String>,
    pub conf_rev: u32,
    pub smp_mod: SampleMode,
    pub smp_rate: u16,
    pub nof_asdu: u8,
    pub multicast: bool,
    pub options: u8,
    pub address: Option<PhyComAddress>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogControlBlock {
    pub name: String,
    pub parent: NodeId,
    pub data_set: Option<String>,
    pub log_ref: Option<String>,
    pub trigger_options: u8,
    pub intg_pd: u32,
    pub log_ena: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub name: String,
    pub parent: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingGroupControlBlock {
    pub parent: NodeId,
    pub act_sg: u8,
    pub num_of_sgs: u8,
}

/// A complete device model.
#[derive(Debug, Clone, PartialEq)]
pub struct IedModel {
    nodes: Vec<ModelNode>,
    data_sets: Vec<DataSet>,
    report_controls: Vec<ReportControlBlock>,
    gse_controls: Vec<GseControlBlock>,
    sv_controls: Vec<SvControlBlock>,
    log_controls: Vec<LogControlBlock>,
    logs: Vec<Log>,
    setting_groups: Vec<SettingGroupControlBlock>,
}

impl IedModel {
    /// Create an empty model whose root device carries `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            nodes: vec![ModelNode {
                name: name.into(),
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Device,
            }],
            data_sets: Vec::new(),
            report_controls: Vec::new(),
            gse_controls: Vec::new(),
            sv_controls: Vec::new(),
            log_controls: Vec::new(),
            logs: Vec::new(),
            setting_groups: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn name(&self) -> &str {
        &self.nodes[0].name
    }

    pub fn node(&self, id: NodeId) -> &ModelNode {
        &self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn push(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(ModelNode {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            kind,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    // ========================================================================
    // Dynamic model API
    // ========================================================================

    pub fn create_logical_device(&mut self, name: &str) -> NodeId {
        self.push(self.root(), name, NodeKind::LogicalDevice)
    }

    pub fn create_logical_node(&mut self, ld: NodeId, name: &str) -> NodeId {
        self.push(ld, name, NodeKind::LogicalNode)
    }

    /// Create a data object below a logical node or another data object.
    pub fn create_data_object(&mut self, parent: NodeId, name: &str, cdc: Option<&str>) -> NodeId {
        self.push(
            parent,
            name,
            NodeKind::DataObject {
                cdc: cdc.map(str::to_string),
            },
        )
    }

    /// Create a data attribute below a data object or a constructed attribute.
    pub fn create_data_attribute(
        &mut self,
        parent: NodeId,
        name: &str,
        attr_type: AttributeType,
        fc: FunctionalConstraint,
        trigger_options: u8,
    ) -> NodeId {
        self.push(
            parent,
            name,
            NodeKind::DataAttribute(DataAttribute {
                attr_type,
                fc,
                trigger_options,
                value: None,
                updated_at: None,
            }),
        )
    }

    /// Attach a value to a leaf attribute. Returns `false` for other nodes.
    pub fn set_value(&mut self, id: NodeId, value: MmsValue) -> bool {
        match &mut self.nodes[id.0].kind {
            NodeKind::DataAttribute(attr) if attr.attr_type != AttributeType::Constructed => {
                attr.value = Some(value);
                attr.updated_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn create_data_set(&mut self, ln: NodeId, name: &str) -> usize {
        self.data_sets.push(DataSet {
            name: name.to_string(),
            parent: ln,
            entries: Vec::new(),
        });
        self.data_sets.len() - 1
    }

    pub fn add_data_set_entry(&mut self, data_set: usize, entry: DataSetEntry) {
        if let Some(ds) = self.data_sets.get_mut(data_set) {
            ds.entries.push(entry);
        }
    }

    pub fn create_report_control(&mut self, rcb: ReportControlBlock) -> usize {
        self.report_controls.push(rcb);
        self.report_controls.len() - 1
    }

    pub fn create_gse_control(&mut self, gse: GseControlBlock) -> usize {
        self.gse_controls.push(gse);
        self.gse_controls.len() - 1
    }

    pub fn create_sv_control(&mut self, svcb: SvControlBlock) -> usize {
        self.sv_controls.push(svcb);
        self.sv_controls.len() - 1
    }

    pub fn create_log(&mut self, ln: NodeId, name: &str) {
        if !self.logs.iter().any(|l| l.parent == ln && l.name == name) {
            self.logs.push(Log {
                name: name.to_string(),
                parent: ln,
            });
        }
    }

    pub fn create_log_control(&mut self, lcb: LogControlBlock) -> usize {
        self.log_controls.push(lcb);
        self.log_controls.len() - 1
    }

    pub fn create_setting_group_control(&mut self, ln: NodeId, act_sg: u8, num_of_sgs: u8) {
        self.setting_groups.retain(|sg| sg.parent != ln);
        self.setting_groups.push(SettingGroupControlBlock {
            parent: ln,
            act_sg,
            num_of_sgs,
        });
    }

    pub fn set_gse_address(&mut self, gse: usize, address: PhyComAddress) -> bool {
        match self.gse_controls.get_mut(gse) {
            Some(cb) => {
                cb.address = Some(address);
                true
            }
            None => false,
        }
    }

    pub fn set_sv_address(&mut self, svcb: usize, address: PhyComAddress) -> bool {
        match self.sv_controls.get_mut(svcb) {
            Some(cb) => {
                cb.address = Some(address);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn logical_devices(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[0].children.iter().copied()
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child.0].name == name)
    }

    /// Find a logical device by instance name, or by the IED-prefixed name.
    pub fn find_logical_device(&self, name: &str) -> Option<NodeId> {
        self.find_child(self.root(), name).or_else(|| {
            name.strip_prefix(self.name())
                .filter(|inst| !inst.is_empty())
                .and_then(|inst| self.find_child(self.root(), inst))
        })
    }

    /// Resolve `LD/LN.DO.DA...` to a node. Empty path segments are ignored,
    /// so DO-level dataset references with a trailing dot resolve too.
    pub fn find_by_reference(&self, reference: &str) -> Option<NodeId> {
        let (ld_name, path) = reference.split_once('/')?;
        let mut current = self.find_logical_device(ld_name)?;
        let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();
        segments.peek()?;
        for segment in segments {
            current = self.find_child(current, segment)?;
        }
        Some(current)
    }

    /// `LD/LN.DO.DA` reference of a node below a logical device.
    pub fn object_reference(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            let node = &self.nodes[node_id.0];
            if matches!(node.kind, NodeKind::Device) {
                break;
            }
            names.push(node.name.as_str());
            cursor = node.parent;
        }
        names.reverse();
        match names.split_first() {
            Some((ld, rest)) if !rest.is_empty() => format!("{}/{}", ld, rest.join(".")),
            Some((ld, _)) => ld.to_string(),
            None => String::new(),
        }
    }

    pub fn attribute(&self, id: NodeId) -> Option<&DataAttribute> {
        match &self.nodes[id.0].kind {
            NodeKind::DataAttribute(attr) => Some(attr),
            _ => None,
        }
    }

    /// Read a node's value restricted to one functional constraint.
    ///
    /// Leaves must match `fc`. Data objects and constructed attributes
    /// return a structure of their matching children, or `None` if no child
    /// matches.
    pub fn read_value(&self, id: NodeId, fc: FunctionalConstraint) -> Option<MmsValue> {
        let node = &self.nodes[id.0];
        match &node.kind {
            NodeKind::DataAttribute(attr) if attr.attr_type != AttributeType::Constructed => {
                if attr.fc == fc {
                    attr.value.clone()
                } else {
                    None
                }
            }
            NodeKind::DataAttribute(_) | NodeKind::DataObject { .. } => {
                let members: Vec<MmsValue> = node
                    .children
                    .iter()
                    .filter_map(|child| self.read_value(*child, fc))
                    .collect();
                if members.is_empty() {
                    None
                } else {
                    Some(MmsValue::Structure(members))
                }
            }
            _ => None,
        }
    }

    pub fn data_set(&self, ln: NodeId, name: &str) -> Option<&DataSet> {
        self.data_sets
            .iter()
            .find(|ds| ds.parent == ln && ds.name == name)
    }

    pub fn data_sets(&self) -> &[DataSet] {
        &self.data_sets
    }

    pub fn report_controls(&self) -> &[ReportControlBlock] {
        &self.report_controls
    }

    pub fn gse_controls(&self) -> &[GseControlBlock] {
        &self.gse_controls
    }

    pub fn sv_controls(&self) -> &[SvControlBlock] {
        &self.sv_controls
    }

    pub fn log_controls(&self) -> &[LogControlBlock] {
        &self.log_controls
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn setting_groups(&self) -> &[SettingGroupControlBlock] {
        &self.setting_groups
    }
}
