//! Datasets, control blocks and layer-2 communication addresses.

use super::{ModelBuilder, PendingNode, TRIGGER_FLAGS};
use crate::document::Document;
use crate::engine::model::{
    goose_options, report_options, sv_options, DataSetEntry, GseControlBlock, LogControlBlock,
    PhyComAddress, ReportControlBlock, SampleMode, SvControlBlock,
};
use crate::engine::NodeId;

const LLN0: &str = "LLN0";

const REPORT_FLAGS: &[(&str, u16)] = &[
    ("seq_num", report_options::SEQ_NUM),
    ("seqNum", report_options::SEQ_NUM),
    ("time_stamp", report_options::TIME_STAMP),
    ("timeStamp", report_options::TIME_STAMP),
    ("reason_for_inclusion", report_options::REASON_FOR_INCLUSION),
    ("reasonCode", report_options::REASON_FOR_INCLUSION),
    ("data_set", report_options::DATA_SET),
    ("dataSet", report_options::DATA_SET),
    ("data_reference", report_options::DATA_REFERENCE),
    ("dataRef", report_options::DATA_REFERENCE),
    ("buf_overflow", report_options::BUFFER_OVERFLOW),
    ("bufOvfl", report_options::BUFFER_OVERFLOW),
    ("entry_id", report_options::ENTRY_ID),
    ("entryID", report_options::ENTRY_ID),
    ("conf_rev", report_options::CONF_REV),
    ("configRef", report_options::CONF_REV),
    ("segmentation", report_options::SEGMENTATION),
];

const GOOSE_FLAGS: &[(&str, u16)] = &[
    ("fixed_offs", goose_options::FIXED_OFFS as u16),
    ("needs_commissioning", goose_options::NEEDS_COMMISSIONING as u16),
    ("test", goose_options::TEST as u16),
];

const SV_FLAGS: &[(&str, u16)] = &[
    ("refresh_time", sv_options::REFRESH_TIME as u16),
    ("sample_sync", sv_options::SAMPLE_SYNC as u16),
    ("sample_rate", sv_options::SAMPLE_RATE as u16),
    ("data_set", sv_options::DATA_SET as u16),
    ("security", sv_options::SECURITY as u16),
];

/// Report options that are not optional fields but are accepted in the same map.
const REPORT_IGNORED: &[(&str, u16)] = &[("trigger", 0)];

const DEFAULT_CONF_REV: u32 = 1;
const DEFAULT_GOOSE_MIN_TIME: u32 = 10;
const DEFAULT_GOOSE_MAX_TIME: u32 = 1000;
const DEFAULT_SMP_RATE: u16 = 80;
const DEFAULT_VLAN_PRIORITY: u8 = 4;

impl<'d> ModelBuilder<'d> {
    /// Second pass: everything that refers to the finished tree.
    pub(super) fn build_controls(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for node in &pending {
            let path = format!("{}/{}", node.ld_name, node.ln_name);
            self.build_data_sets(node, &path);
            self.build_report_controls(node, &path);
            self.build_gse_controls(node, &path);
            self.build_sv_controls(node, &path);
            self.build_log_controls(node, &path);
            if let Some(sgcb) = node.doc.field("setting_group_control") {
                self.build_setting_group(node, sgcb, &path);
            }
        }
    }

    /// Entries of a control section given either as a map keyed by name or
    /// as an array of maps carrying `name`.
    fn named_entries(
        &mut self,
        doc: &'d Document,
        key: &str,
        path: &str,
    ) -> Vec<(String, &'d Document)> {
        match doc.field(key) {
            None => Vec::new(),
            Some(Document::Map(map)) => map
                .iter()
                .map(|(name, entry)| {
                    let name = entry.str_field("name").unwrap_or(name).to_string();
                    (name, entry)
                })
                .collect(),
            Some(Document::Array(items)) => {
                let mut entries = Vec::new();
                for (i, entry) in items.iter().enumerate() {
                    match entry.str_field("name").filter(|name| !name.is_empty()) {
                        Some(name) => entries.push((name.to_string(), entry)),
                        None => self.warn(
                            format!("{}.{}[{}]", path, key, i),
                            "entry has no name",
                        ),
                    }
                }
                entries
            }
            Some(other) => {
                self.warn(
                    path,
                    format!("'{}' must be a map or array, got {}", key, other.kind()),
                );
                Vec::new()
            }
        }
    }

    fn u32_field(&mut self, doc: &Document, key: &str, default: u32, path: &str) -> u32 {
        match doc.field(key) {
            None => default,
            Some(value) => match integer_value(value).and_then(|i| u32::try_from(i).ok()) {
                Some(v) => v,
                None => {
                    self.warn(path, format!("invalid '{}', using {}", key, default));
                    default
                }
            },
        }
    }

    fn bool_field(doc: &Document, key: &str, default: bool) -> bool {
        match doc.field(key) {
            Some(Document::Bool(b)) => *b,
            Some(Document::Integer(i)) => *i != 0,
            _ => default,
        }
    }

    /// Dataset name referenced by a control block, checked against the LN.
    fn referenced_data_set(&mut self, ln: NodeId, doc: &Document, path: &str) -> Option<String> {
        let name = doc
            .str_field("dataset")
            .or_else(|| doc.str_field("data_set"))
            .filter(|name| !name.is_empty())?
            .to_string();
        if self.model.data_set(ln, &name).is_none() {
            self.warn(path, format!("dataset '{}' is not defined on this node", name));
        }
        Some(name)
    }

    // ========================================================================
    // Datasets
    // ========================================================================

    fn build_data_sets(&mut self, node: &PendingNode<'d>, path: &str) {
        for (name, ds_doc) in self.named_entries(node.doc, "data_sets", path) {
            let ds_path = format!("{}.{}", path, name);
            let data_set = self.model.create_data_set(node.ln, &name);
            let members = match ds_doc.field("fcdas") {
                None => continue,
                Some(Document::Array(items)) => items,
                Some(other) => {
                    self.warn(
                        &ds_path,
                        format!("'fcdas' must be an array, got {}", other.kind()),
                    );
                    continue;
                }
            };
            for member in members {
                let entry = match member {
                    Document::String(text) => parse_fcda_reference(text),
                    Document::Map(_) => fcda_from_map(member, &node.ld_name),
                    _ => None,
                };
                let Some(entry) = entry else {
                    self.warn(&ds_path, format!("unusable FCDA {:?}", member));
                    continue;
                };
                let reference = entry.reference();
                if self.model.find_by_reference(&reference).is_none() {
                    self.warn(
                        &ds_path,
                        format!("FCDA '{}' does not resolve in the model", reference),
                    );
                }
                self.model.add_data_set_entry(data_set, entry);
            }
        }
    }

    // ========================================================================
    // Control blocks
    // ========================================================================

    fn build_report_controls(&mut self, node: &PendingNode<'d>, path: &str) {
        for (name, rcb_doc) in self.named_entries(node.doc, "report_controls", path) {
            let rcb_path = format!("{}.{}", path, name);
            let data_set = self.referenced_data_set(node.ln, rcb_doc, &rcb_path);

            let (options, mut trigger_options) = match rcb_doc.field("options") {
                Some(options) => {
                    let bits = self.flag_bits_with(
                        options,
                        &rcb_path,
                        REPORT_FLAGS,
                        &[TRIGGER_FLAGS, REPORT_IGNORED].concat(),
                    );
                    let triggers = match options {
                        Document::Map(_) => self.report_triggers(options),
                        _ => 0,
                    };
                    (bits, triggers)
                }
                None => (0, 0),
            };
            if let Some(explicit) = rcb_doc.field("trigger_options") {
                trigger_options = self.trigger_bits(explicit, &rcb_path);
            }

            let rcb = ReportControlBlock {
                name: name.clone(),
                parent: node.ln,
                rpt_id: rcb_doc
                    .str_field("rptid")
                    .filter(|id| !id.is_empty())
                    .map(str::to_string),
                buffered: Self::bool_field(rcb_doc, "buffered", false),
                data_set,
                conf_rev: self.u32_field(rcb_doc, "conf_rev", DEFAULT_CONF_REV, &rcb_path),
                trigger_options,
                options,
                buf_time: self.u32_field(rcb_doc, "buf_time", 0, &rcb_path),
                intg_pd: self.u32_field(rcb_doc, "intg_pd", 0, &rcb_path),
            };
            self.model.create_report_control(rcb);
        }
    }

    /// Trigger flags embedded in a report `options` map.
    fn report_triggers(&mut self, options: &Document) -> u8 {
        let Some(map) = options.as_map() else {
            return 0;
        };
        let mut bits = 0u16;
        for (key, enabled) in map {
            if let Some((_, bit)) = TRIGGER_FLAGS.iter().find(|(name, _)| name == key) {
                if enabled.as_bool().unwrap_or(false) {
                    bits |= bit;
                }
            }
        }
        u8::try_from(bits).unwrap_or(u8::MAX)
    }

    fn build_gse_controls(&mut self, node: &PendingNode<'d>, path: &str) {
        for (name, gse_doc) in self.named_entries(node.doc, "gse_controls", path) {
            let gse_path = format!("{}.{}", path, name);
            let data_set = self.referenced_data_set(node.ln, gse_doc, &gse_path);

            let app_id = gse_doc
                .str_field("app_id")
                .or_else(|| gse_doc.str_field("gocbname"))
                .filter(|id| !id.is_empty())
                .unwrap_or(&name)
                .to_string();

            let mut options = match gse_doc.field("options") {
                Some(options) => self.flag_bits(options, &gse_path, GOOSE_FLAGS),
                None => 0,
            };
            if Self::bool_field(gse_doc, "fixed_offs", false) {
                options |= u16::from(goose_options::FIXED_OFFS);
            }

            let time_allowed_to_live = self.u32_field(gse_doc, "time_allowed_to_live", 0, &gse_path);
            let default_max = if time_allowed_to_live > 0 {
                time_allowed_to_live / 2
            } else {
                DEFAULT_GOOSE_MAX_TIME
            };

            let gse = GseControlBlock {
                name: name.clone(),
                parent: node.ln,
                app_id,
                data_set,
                conf_rev: self.u32_field(gse_doc, "conf_rev", DEFAULT_CONF_REV, &gse_path),
                min_time: self.u32_field(gse_doc, "min_time", DEFAULT_GOOSE_MIN_TIME, &gse_path),
                max_time: self.u32_field(gse_doc, "max_time", default_max, &gse_path),
                options: u8::try_from(options).unwrap_or(u8::MAX),
                address: None,
            };
            let index = self.model.create_gse_control(gse);
            self.gse_blocks.push((node.ld_name.clone(), name, index));
        }
    }

    fn build_sv_controls(&mut self, node: &PendingNode<'d>, path: &str) {
        for (name, sv_doc) in self.named_entries(node.doc, "smv_controls", path) {
            let sv_path = format!("{}.{}", path, name);
            let data_set = self.referenced_data_set(node.ln, sv_doc, &sv_path);

            let sv_id = sv_doc
                .str_field("sv_id")
                .or_else(|| sv_doc.str_field("smvcbname"))
                .filter(|id| !id.is_empty())
                .unwrap_or(&name)
                .to_string();

            let smp_mod = match sv_doc.field("smpmod") {
                None => SampleMode::SamplesPerPeriod,
                Some(mode) => parse_sample_mode(mode).unwrap_or_else(|| {
                    self.warn(&sv_path, format!("unknown smpmod {:?}, using SmpPerPeriod", mode));
                    SampleMode::SamplesPerPeriod
                }),
            };
            let smp_rate = self.u32_field(sv_doc, "smprate", u32::from(DEFAULT_SMP_RATE), &sv_path);
            let smp_rate = u16::try_from(smp_rate).unwrap_or_else(|_| {
                self.warn(&sv_path, format!("smprate {} out of range", smp_rate));
                DEFAULT_SMP_RATE
            });
            let nof_asdu = self.u32_field(sv_doc, "nof_asdu", 1, &sv_path);
            let nof_asdu = u8::try_from(nof_asdu).unwrap_or_else(|_| {
                self.warn(&sv_path, format!("nof_asdu {} out of range", nof_asdu));
                1
            });
            let options = match sv_doc.field("options") {
                Some(options) => self.flag_bits(options, &sv_path, SV_FLAGS),
                None => 0,
            };

            let svcb = SvControlBlock {
                name: name.clone(),
                parent: node.ln,
                sv_id,
                data_set,
                conf_rev: self.u32_field(sv_doc, "conf_rev", DEFAULT_CONF_REV, &sv_path),
                smp_mod,
                smp_rate,
                nof_asdu,
                multicast: Self::bool_field(sv_doc, "multicast", true),
                options: u8::try_from(options).unwrap_or(u8::MAX),
                address: None,
            };
            let index = self.model.create_sv_control(svcb);
            self.sv_blocks.push((node.ld_name.clone(), name, index));
        }
    }

    fn build_log_controls(&mut self, node: &PendingNode<'d>, path: &str) {
        for (name, lcb_doc) in self.named_entries(node.doc, "log_controls", path) {
            let lcb_path = format!("{}.{}", path, name);
            let data_set = self.referenced_data_set(node.ln, lcb_doc, &lcb_path);

            let log_ref = lcb_doc
                .str_field("logname")
                .filter(|log| !log.is_empty())
                .map(str::to_string);
            if let Some(log) = &log_ref {
                self.model.create_log(node.ln, log);
            }
            let trigger_options = match lcb_doc.field("options") {
                Some(options) => self.trigger_bits(options, &lcb_path),
                None => 0,
            };

            let lcb = LogControlBlock {
                name: name.clone(),
                parent: node.ln,
                data_set,
                log_ref,
                trigger_options,
                intg_pd: self.u32_field(lcb_doc, "intg_pd", 0, &lcb_path),
                log_ena: Self::bool_field(lcb_doc, "log_ena", false),
            };
            self.model.create_log_control(lcb);
        }
    }

    fn build_setting_group(&mut self, node: &PendingNode<'d>, sgcb: &Document, path: &str) {
        if node.ln_name != LLN0 {
            self.warn(path, "setting group control is only allowed on LLN0");
            return;
        }
        if !sgcb.is_map() {
            self.warn(
                path,
                format!("setting_group_control must be a map, got {}", sgcb.kind()),
            );
            return;
        }

        let requested_groups = self.u32_field(sgcb, "num_of_sgs", 1, path);
        let num_of_sgs = u8::try_from(requested_groups.max(1)).unwrap_or(u8::MAX);
        if u32::from(num_of_sgs) != requested_groups {
            self.warn(
                path,
                format!("num_of_sgs {} clamped to {}", requested_groups, num_of_sgs),
            );
        }
        let requested_active = self.u32_field(sgcb, "act_sg", 1, path);
        let act_sg = requested_active.clamp(1, u32::from(num_of_sgs));
        if act_sg != requested_active {
            self.warn(
                path,
                format!("act_sg {} clamped to {}", requested_active, act_sg),
            );
        }
        // act_sg <= num_of_sgs <= u8::MAX
        let act_sg = u8::try_from(act_sg).unwrap_or(num_of_sgs);
        self.model
            .create_setting_group_control(node.ln, act_sg, num_of_sgs);
    }

    // ========================================================================
    // Communication section
    // ========================================================================

    pub(super) fn apply_communication(&mut self, communication: &Document) {
        if !communication.is_map() {
            self.warn(
                "communication",
                format!("must be a map, got {}", communication.kind()),
            );
            return;
        }
        for (kind, blocks) in [("gse", BlockKind::Goose), ("smv", BlockKind::SampledValues)] {
            let path = format!("communication.{}", kind);
            let entries: Vec<(Option<String>, &Document)> = match communication.field(kind) {
                None => continue,
                Some(Document::Array(items)) => items.iter().map(|e| (None, e)).collect(),
                Some(Document::Map(map)) => {
                    map.iter().map(|(cb, e)| (Some(cb.clone()), e)).collect()
                }
                Some(other) => {
                    self.warn(&path, format!("must be a map or array, got {}", other.kind()));
                    continue;
                }
            };
            for (key, entry) in entries {
                self.apply_address(blocks, key, entry, &path);
            }
        }
    }

    fn apply_address(
        &mut self,
        blocks: BlockKind,
        key: Option<String>,
        entry: &Document,
        path: &str,
    ) {
        let Some(cb_name) = entry
            .str_field("cb_name")
            .or_else(|| entry.str_field("cbName"))
            .map(str::to_string)
            .or(key)
        else {
            self.warn(path, "address entry has no cb_name");
            return;
        };
        let ld_inst = entry
            .str_field("ld_inst")
            .or_else(|| entry.str_field("ldInst"))
            .filter(|ld| !ld.is_empty());
        let entry_path = match ld_inst {
            Some(ld) => format!("{}.{}/{}", path, ld, cb_name),
            None => format!("{}.{}", path, cb_name),
        };

        let table = match blocks {
            BlockKind::Goose => &self.gse_blocks,
            BlockKind::SampledValues => &self.sv_blocks,
        };
        let matches: Vec<usize> = table
            .iter()
            .filter(|(ld, cb, _)| cb == &cb_name && ld_inst.map_or(true, |want| want == ld))
            .map(|(_, _, index)| *index)
            .collect();
        let index = match matches.as_slice() {
            [index] => *index,
            [] => {
                self.warn(&entry_path, "no matching control block");
                return;
            }
            _ => {
                self.warn(&entry_path, "control block name is ambiguous without ld_inst");
                return;
            }
        };

        let address = match parse_address(entry) {
            Ok(address) => address,
            Err(message) => {
                self.warn(&entry_path, message);
                return;
            }
        };
        match blocks {
            BlockKind::Goose => self.model.set_gse_address(index, address),
            BlockKind::SampledValues => self.model.set_sv_address(index, address),
        };
    }
}

#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Goose,
    SampledValues,
}

fn integer_value(doc: &Document) -> Option<i64> {
    doc.as_whole_i64()
}

/// Integer given either as a number or as a hex string (`"0x1000"`, `"1000"`).
fn integer_or_hex(doc: &Document) -> Option<i64> {
    match doc {
        Document::String(text) => {
            let digits = text
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            i64::from_str_radix(digits, 16).ok()
        }
        other => integer_value(other),
    }
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let digits: String = text.chars().filter(|c| *c != '-' && *c != ':').collect();
    let bytes = hex::decode(digits).ok()?;
    bytes.try_into().ok()
}

fn parse_address(entry: &Document) -> Result<PhyComAddress, String> {
    let mac_text = entry
        .str_field("mac_address")
        .ok_or_else(|| "mac_address is required".to_string())?;
    let dst_address =
        parse_mac(mac_text).ok_or_else(|| format!("invalid mac_address '{}'", mac_text))?;

    let app_id = entry
        .field("app_id")
        .ok_or_else(|| "app_id is required".to_string())?;
    let app_id = integer_or_hex(app_id)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| format!("invalid app_id {:?}", app_id))?;

    let vlan_id = match entry.field("vlan_id") {
        None => 0,
        Some(doc) => integer_or_hex(doc)
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| *v <= 0x0FFF)
            .ok_or_else(|| format!("invalid vlan_id {:?}", doc))?,
    };
    let vlan_priority = match entry.field("vlan_priority") {
        None => DEFAULT_VLAN_PRIORITY,
        Some(doc) => integer_value(doc)
            .and_then(|v| u8::try_from(v).ok())
            .filter(|v| *v <= 7)
            .ok_or_else(|| format!("invalid vlan_priority {:?}", doc))?,
    };

    Ok(PhyComAddress {
        vlan_priority,
        vlan_id,
        app_id,
        dst_address,
    })
}

fn parse_sample_mode(doc: &Document) -> Option<SampleMode> {
    match doc {
        Document::Integer(0) => Some(SampleMode::SamplesPerPeriod),
        Document::Integer(1) => Some(SampleMode::SamplesPerSecond),
        Document::Integer(2) => Some(SampleMode::SecondsPerSample),
        Document::String(text) => match text.as_str() {
            "" | "SmpPerPeriod" => Some(SampleMode::SamplesPerPeriod),
            "SmpPerSec" => Some(SampleMode::SamplesPerSecond),
            "SecPerSmp" => Some(SampleMode::SecondsPerSample),
            _ => None,
        },
        _ => None,
    }
}

/// Parse `LD/LN.DO[.DA...]`, with an optional `[n]` after the data object.
/// A trailing dot, or no attribute part, gives a DO-level member.
fn parse_fcda_reference(text: &str) -> Option<DataSetEntry> {
    let (ld, rest) = text.trim().split_once('/')?;
    let mut segments = rest.split('.');
    let ln = segments.next().filter(|s| !s.is_empty())?;
    let data_object = segments.next().filter(|s| !s.is_empty())?;
    let component: Vec<&str> = segments.collect();
    let component = component.join(".");

    let (data_object, index) = split_index(data_object)?;
    if ld.is_empty() {
        return None;
    }
    Some(DataSetEntry {
        logical_device: ld.to_string(),
        variable: format!("{}.{}", ln, data_object),
        index,
        component: Some(component).filter(|c| !c.is_empty()),
    })
}

fn split_index(name: &str) -> Option<(&str, Option<u32>)> {
    match name.strip_suffix(']').and_then(|s| s.split_once('[')) {
        Some((base, index)) => Some((base, Some(index.parse().ok()?))),
        None => Some((name, None)),
    }
}

/// Build an entry from `{ldInst, prefix, lnClass, lnInst, doName, daName}`.
fn fcda_from_map(doc: &Document, current_ld: &str) -> Option<DataSetEntry> {
    let text = |camel: &str, snake: &str| -> String {
        doc.str_field(camel)
            .or_else(|| doc.str_field(snake))
            .unwrap_or("")
            .to_string()
    };
    let ld = text("ldInst", "ld_inst");
    let ln_class = text("lnClass", "ln_class");
    let do_name = text("doName", "do_name");
    if ln_class.is_empty() || do_name.is_empty() {
        return None;
    }
    let ln = format!("{}{}{}", text("prefix", "prefix"), ln_class, text("lnInst", "ln_inst"));
    let da_name = text("daName", "da_name");
    Some(DataSetEntry {
        logical_device: if ld.is_empty() {
            current_ld.to_string()
        } else {
            ld
        },
        variable: format!("{}.{}", ln, do_name),
        index: None,
        component: Some(da_name).filter(|da| !da.is_empty()),
    })
}
