//! Switch control channel messages.
//!
//! Frames are newline-delimited JSON objects tagged by `type`. Outbound:
//! `flow_mod`, `barrier`, `stats_request`. Inbound: `hello`, `stats_reply`,
//! `barrier_reply`, `error`.

use crate::types::Masked;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Match fields used by monitoring flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    /// Packed subscriber id.
    Imsi,
    Direction,
    RuleNum,
    RuleVersion,
    /// Classification scratch register.
    StatsClass,
    /// Tunnel endpoint id.
    Teid,
    EthType,
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchValue {
    Num(u64),
    Ipv4(Masked<Ipv4Addr>),
    Ipv6(Masked<Ipv6Addr>),
}

/// Match criteria of a flow. Absent fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowMatch {
    fields: BTreeMap<MatchField, MatchValue>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: MatchField, value: MatchValue) -> Self {
        self.set(field, value);
        self
    }

    pub fn with_num(self, field: MatchField, value: u64) -> Self {
        self.with(field, MatchValue::Num(value))
    }

    pub fn set(&mut self, field: MatchField, value: MatchValue) {
        self.fields.insert(field, value);
    }

    pub fn get(&self, field: MatchField) -> Option<&MatchValue> {
        self.fields.get(&field)
    }

    /// Numeric register value; `None` when absent or not numeric.
    pub fn get_num(&self, field: MatchField) -> Option<u64> {
        match self.fields.get(&field) {
            Some(MatchValue::Num(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ipv4(&self, field: MatchField) -> Option<Masked<Ipv4Addr>> {
        match self.fields.get(&field) {
            Some(MatchValue::Ipv4(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ipv6(&self, field: MatchField) -> Option<Masked<Ipv6Addr>> {
        match self.fields.get(&field) {
            Some(MatchValue::Ipv6(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn contains(&self, field: MatchField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// A raw counter entry from a stats reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStat {
    pub table_id: u8,
    #[serde(default)]
    pub cookie: u64,
    #[serde(default)]
    pub priority: u16,
    pub byte_count: u64,
    pub packet_count: u64,
    #[serde(rename = "match", default)]
    pub flow_match: FlowMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowModCommand {
    Add,
    /// Non-strict delete: removes every flow the match covers.
    Delete,
}

/// Flow install/delete directive. Installed flows always drop and count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
}

impl FlowMod {
    pub fn add(table_id: u8, priority: u16, cookie: u64, flow_match: FlowMatch) -> Self {
        Self {
            command: FlowModCommand::Add,
            table_id,
            priority,
            cookie,
            flow_match,
        }
    }

    pub fn delete(table_id: u8, flow_match: FlowMatch) -> Self {
        Self {
            command: FlowModCommand::Delete,
            table_id,
            priority: 0,
            cookie: 0,
            flow_match,
        }
    }

    /// Deletes every flow in the table.
    pub fn delete_all(table_id: u8) -> Self {
        Self::delete(table_id, FlowMatch::new())
    }
}

/// Messages sent to the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchMessage {
    FlowMod { xid: u32, flow_mod: FlowMod },
    Barrier { xid: u32 },
    StatsRequest {
        xid: u32,
        table_id: u8,
        cookie: u64,
        cookie_mask: u64,
    },
}

impl SwitchMessage {
    pub fn xid(&self) -> u32 {
        match self {
            Self::FlowMod { xid, .. } | Self::Barrier { xid } | Self::StatsRequest { xid, .. } => {
                *xid
            }
        }
    }
}

/// One stats reply batch. `more` marks intermediate batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReply {
    pub datapath_id: u64,
    #[serde(default)]
    pub xid: u32,
    #[serde(default)]
    pub more: bool,
    #[serde(default)]
    pub body: Vec<FlowStat>,
}

/// Messages received from the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchEvent {
    Hello { datapath_id: u64 },
    StatsReply(StatsReply),
    BarrierReply { xid: u32 },
    Error { xid: u32, code: u16, reason: String },
}
