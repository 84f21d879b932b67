//! Counter entries -> per-subscriber, per-rule usage.

use crate::codec::{decode_entry, DecodedEntry};
use crate::collaborators::{PrefixResolver, RuleNumMapper};
use crate::error::{EnforcementStatsError, Result};
use crate::protocol::FlowStat;
use crate::tables::constants::{DEFAULT_FLOW_COOKIE, ETH_FRAME_SIZE_BYTES};
use crate::types::{Direction, NgSessionState, StatsClass, UsageKey, UsageRecord};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Usage of one poll cycle, ordered by key.
pub type UsageMap = BTreeMap<UsageKey, UsageRecord>;

/// Whom a counter entry's bytes belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attribution {
    Rule(String),
    /// Table-wide deny-all flow.
    DefaultFlow,
    /// Per-subscriber default-drop flow.
    DefaultDrop,
    /// Rule number the mapper does not know.
    Unknown(u32),
}

pub struct UsageAggregator {
    tbl_num: u8,
    default_drop_flow_name: String,
    rule_mapper: Arc<dyn RuleNumMapper>,
    prefixes: Arc<dyn PrefixResolver>,
    unmatched_bytes: u64,
}

impl UsageAggregator {
    pub fn new(
        tbl_num: u8,
        default_drop_flow_name: impl Into<String>,
        rule_mapper: Arc<dyn RuleNumMapper>,
        prefixes: Arc<dyn PrefixResolver>,
    ) -> Self {
        Self {
            tbl_num,
            default_drop_flow_name: default_drop_flow_name.into(),
            rule_mapper,
            prefixes,
            unmatched_bytes: 0,
        }
    }

    /// Last byte count seen on the table-wide deny-all flow.
    pub fn unmatched_bytes(&self) -> u64 {
        self.unmatched_bytes
    }

    pub fn reset(&mut self) {
        self.unmatched_bytes = 0;
    }

    /// Aggregates one complete batch. Fails only when rule resolution
    /// storage is unavailable; the whole batch is then dropped.
    pub fn aggregate(&mut self, stats: &[FlowStat]) -> Result<UsageMap> {
        let mut usage = UsageMap::new();

        for stat in stats {
            if stat.table_id != self.tbl_num {
                continue;
            }
            let entry = decode_entry(&stat.flow_match);

            let rule_id = match self.attribute(stat, &entry)? {
                Attribution::Rule(rule_id) => rule_id,
                Attribution::DefaultDrop => self.default_drop_flow_name.clone(),
                Attribution::DefaultFlow => {
                    self.track_unmatched(stat.byte_count);
                    continue;
                }
                Attribution::Unknown(rule_num) => {
                    warn!(rule_num, "Skipping counter entry with unknown rule number");
                    continue;
                }
            };

            if entry.class == Some(StatsClass::Ignored) {
                continue;
            }
            let Some(sid) = entry.sid.as_deref() else {
                continue;
            };

            let ip = self.resolve_ue_ip(&entry);
            let version = entry.version.unwrap_or(0);
            let key = UsageKey::new(sid, &rule_id, ip, version);

            let record = usage.entry(key).or_insert_with(|| UsageRecord {
                rule_id: rule_id.clone(),
                sid: sid.to_string(),
                rule_version: version,
                ue_ipv4: match ip {
                    Some(IpAddr::V4(v4)) => Some(v4),
                    _ => None,
                },
                ue_ipv6: match ip {
                    Some(IpAddr::V6(v6)) => Some(v6),
                    _ => None,
                },
                teid: entry.teid,
                ..UsageRecord::default()
            });

            let (rx, tx) = match entry.direction {
                Some(Direction::In) => (downlink_bytes(stat), 0),
                _ => (0, stat.byte_count),
            };
            if entry.class == Some(StatsClass::Measured) {
                record.bytes_rx += rx;
                record.bytes_tx += tx;
            } else {
                record.dropped_rx += rx;
                record.dropped_tx += tx;
            }
        }

        Ok(usage)
    }

    fn attribute(&self, stat: &FlowStat, entry: &DecodedEntry) -> Result<Attribution> {
        match entry.rule_num.unwrap_or(0) {
            0 if stat.cookie == DEFAULT_FLOW_COOKIE => Ok(Attribution::DefaultFlow),
            0 => Ok(Attribution::DefaultDrop),
            rule_num => match self.rule_mapper.rule_id(rule_num) {
                Ok(rule_id) => Ok(Attribution::Rule(rule_id)),
                Err(EnforcementStatsError::ResolutionFailure { .. }) => {
                    Ok(Attribution::Unknown(rule_num))
                }
                Err(e) => Err(e),
            },
        }
    }

    fn track_unmatched(&mut self, byte_count: u64) {
        // the switch accumulates, so overwrite instead of adding
        if byte_count != self.unmatched_bytes {
            if byte_count != 0 {
                debug!(bytes = byte_count, "Traffic hit the default deny-all flow");
            }
            self.unmatched_bytes = byte_count;
        }
    }

    fn resolve_ue_ip(&self, entry: &DecodedEntry) -> Option<IpAddr> {
        if let Some(v4) = entry.ipv4 {
            return Some(IpAddr::V4(v4.addr()));
        }
        entry.ipv6.map(|v6| IpAddr::V6(self.resolve_ipv6(v6.addr())))
    }

    /// Rebuilds the UE address from its /64 prefix and interface id when one
    /// is registered; otherwise the matched address is used as is.
    fn resolve_ipv6(&self, addr: Ipv6Addr) -> Ipv6Addr {
        let prefix = self.prefixes.prefix_for(addr);
        match self.prefixes.interface_for(prefix) {
            Some(host) => {
                let ue_ip = Ipv6Addr::from(u128::from(prefix) | u128::from(host));
                debug!(%ue_ip, %prefix, %host, "Recalculated UE IPv6 address");
                ue_ip
            }
            None => addr,
        }
    }
}

/// Inbound byte count without the per-packet Ethernet header.
fn downlink_bytes(stat: &FlowStat) -> u64 {
    stat.byte_count
        .saturating_sub(ETH_FRAME_SIZE_BYTES.saturating_mul(stat.packet_count))
}

/// Per-tunnel session states for the 5G session report.
///
/// Entries without tunnel id, subscriber, or with version 0 are skipped.
/// The first entry per tunnel id wins.
pub fn build_session_states(stats: &[FlowStat], tbl_num: u8) -> HashMap<u32, NgSessionState> {
    let mut sessions = HashMap::new();

    for stat in stats.iter().filter(|s| s.table_id == tbl_num) {
        let entry = decode_entry(&stat.flow_match);
        let (Some(teid), Some(sid)) = (entry.teid.filter(|t| *t != 0), entry.sid) else {
            continue;
        };
        let version = entry.version.unwrap_or(0);
        if version == 0 {
            continue;
        }

        match sessions.entry(teid) {
            Entry::Occupied(existing) => {
                let existing: &NgSessionState = existing.get();
                if existing.subscriber_id != sid || existing.session_version != version {
                    debug!(teid, %sid, version, "Conflicting session state for tunnel id");
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(NgSessionState {
                    subscriber_id: sid,
                    session_version: version,
                    local_f_teid: teid,
                });
            }
        }
    }

    sessions
}
