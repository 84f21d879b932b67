//! Type definitions for enforcement-statsd.
//!
//! Direction and classification registers replace the raw register values
//! written into monitoring flows with type-safe enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Traffic direction of a monitoring flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Uplink, from the UE.
    Out,
    /// Downlink, towards the UE.
    In,
}

impl Direction {
    /// Both directions, inbound first.
    pub const BOTH: [Direction; 2] = [Direction::In, Direction::Out];

    /// Register value written into the direction match field.
    pub const fn reg_value(self) -> u64 {
        match self {
            Self::Out => 0x01,
            Self::In => 0x10,
        }
    }

    pub fn from_reg_value(value: u64) -> Option<Self> {
        match value {
            0x01 => Some(Self::Out),
            0x10 => Some(Self::In),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Out => write!(f, "out"),
            Self::In => write!(f, "in"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "out" | "uplink" => Ok(Self::Out),
            "in" | "downlink" => Ok(Self::In),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// Accounting classification carried in a monitoring flow's scratch register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsClass {
    /// Counts toward billable usage.
    Measured,
    /// App-detection passthrough, excluded from all usage.
    Ignored,
    /// Counts toward dropped usage (rule action is deny).
    DropMeasured,
}

impl StatsClass {
    pub const fn reg_value(self) -> u64 {
        match self {
            Self::Measured => 0,
            Self::Ignored => 1,
            Self::DropMeasured => 2,
        }
    }

    pub fn from_reg_value(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Measured),
            1 => Some(Self::Ignored),
            2 => Some(Self::DropMeasured),
            _ => None,
        }
    }
}

/// A match value that is either exact or carries a mask.
///
/// Resolved once when a counter entry is decoded; callers that only need the
/// base address use [`Masked::addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Masked<T> {
    Exact(T),
    WithMask { value: T, mask: T },
}

impl<T: Copy> Masked<T> {
    /// The base value, mask dropped.
    pub fn addr(&self) -> T {
        match self {
            Self::Exact(value) => *value,
            Self::WithMask { value, .. } => *value,
        }
    }

    pub fn mask(&self) -> Option<T> {
        match self {
            Self::Exact(_) => None,
            Self::WithMask { mask, .. } => Some(*mask),
        }
    }
}

/// Compound usage key: `sid|rule_id[|ip]|version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsageKey(String);

impl UsageKey {
    pub fn new(sid: &str, rule_id: &str, ip: Option<IpAddr>, version: u64) -> Self {
        let key = match ip {
            Some(ip) => format!("{}|{}|{}|{}", sid, rule_id, ip, version),
            None => format!("{}|{}|{}", sid, rule_id, version),
        };
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-subscriber, per-rule usage for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub rule_id: String,
    pub sid: String,
    pub rule_version: u64,
    /// At most one of `ue_ipv4` / `ue_ipv6` is set.
    pub ue_ipv4: Option<Ipv4Addr>,
    pub ue_ipv6: Option<Ipv6Addr>,
    pub teid: Option<u32>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub dropped_rx: u64,
    pub dropped_tx: u64,
}

impl UsageRecord {
    /// UE address the record was keyed on, if any.
    pub fn ue_ip(&self) -> Option<IpAddr> {
        self.ue_ipv4
            .map(IpAddr::V4)
            .or_else(|| self.ue_ipv6.map(IpAddr::V6))
    }
}

/// Records of one poll cycle as sent upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecordTable {
    pub records: Vec<UsageRecord>,
    /// Process-start marker so the far end can tell restarts apart.
    pub epoch: u64,
    /// Set when the switch restarted and counters were reset.
    pub update_rule_versions: bool,
}

impl UsageRecordTable {
    pub fn new(records: Vec<UsageRecord>, epoch: u64, update_rule_versions: bool) -> Self {
        Self {
            records,
            epoch,
            update_rule_versions,
        }
    }

    /// An empty table; still reported, it signals "no active flows".
    pub fn empty(epoch: u64, update_rule_versions: bool) -> Self {
        Self::new(Vec::new(), epoch, update_rule_versions)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// 5G session state keyed by tunnel id in session reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NgSessionState {
    pub subscriber_id: String,
    pub session_version: u64,
    pub local_f_teid: u32,
}

/// Action of a single flow description within a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    Permit,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescription {
    pub action: FlowAction,
}

/// The slice of a policy rule that monitoring flows depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub flow_list: Vec<FlowDescription>,
    /// Application-detection marker; adds an ignored-classification pair.
    #[serde(default)]
    pub app_name: Option<String>,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, actions: &[FlowAction]) -> Self {
        Self {
            id: id.into(),
            flow_list: actions
                .iter()
                .map(|&action| FlowDescription { action })
                .collect(),
            app_name: None,
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// True when any flow description permits traffic.
    pub fn permits(&self) -> bool {
        self.flow_list.iter().any(|f| f.action == FlowAction::Permit)
    }
}

/// Outcome of a flow install; no partial-success state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleModResult {
    Success,
    Failure,
}

impl RuleModResult {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}
