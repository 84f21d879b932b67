//! Interfaces of the collaborators the controller depends on.
//!
//! Calls that cross a process boundary are async. Lookups on the metering
//! hot path (rule id by number, IPv6 prefixes) are plain methods served from
//! memory.

use crate::error::Result;
use crate::protocol::SwitchMessage;
use crate::types::{NgSessionState, UsageRecordTable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};

/// Switch control channel.
#[async_trait]
pub trait Datapath: Send + Sync {
    /// Identity of the connected switch; replies carrying another id are stale.
    fn datapath_id(&self) -> u64;

    /// Queues a message to the switch. Fails with `Transport` when disconnected.
    async fn send(&self, msg: SwitchMessage) -> Result<()>;
}

/// Upstream usage RPC.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn report_rule_stats(&self, table: UsageRecordTable) -> Result<()>;
}

/// Upstream 5G session-state RPC.
#[async_trait]
pub trait SessionStateReporter: Send + Sync {
    async fn report_session_state(&self, sessions: HashMap<u32, NgSessionState>) -> Result<()>;
}

/// Authoritative rule versions.
#[async_trait]
pub trait RuleVersionStore: Send + Sync {
    /// Current version of `rule_id` for the session; 0 when none is stored.
    async fn get_current_version(&self, sid: &str, ip: Option<IpAddr>, rule_id: &str)
        -> Result<u64>;

    /// Records `version` as current once its flows are installed.
    async fn set_version(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        rule_id: &str,
        version: u64,
    ) -> Result<()>;
}

/// Rule id <-> rule number mapping.
#[async_trait]
pub trait RuleNumMapper: Send + Sync {
    /// Fails with `ResolutionFailure` for unknown numbers.
    fn rule_id(&self, rule_num: u32) -> Result<String>;

    /// Allocates a number for a new rule id. The allocation is durable
    /// before it is returned.
    async fn get_or_create_rule_num(&self, rule_id: &str) -> Result<u32>;
}

/// Durable backing for the rule number and IPv6 prefix mappings, so flows
/// installed before a restart stay attributable after it.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn rule_nums(&self) -> Result<Vec<(String, u32)>>;

    async fn save_rule_num(&self, rule_id: &str, rule_num: u32) -> Result<()>;

    async fn prefixes(&self) -> Result<Vec<(Ipv6Addr, Ipv6Addr)>>;

    async fn save_prefix(&self, prefix: Ipv6Addr, interface: Ipv6Addr) -> Result<()>;

    async fn remove_prefix(&self, prefix: Ipv6Addr) -> Result<()>;
}

/// Subscriber IPv6 prefix mapping.
pub trait PrefixResolver: Send + Sync {
    /// The /64 prefix of a (possibly compressed) UE address.
    fn prefix_for(&self, addr: Ipv6Addr) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(addr) & (u128::MAX << 64))
    }

    /// Host-id bits registered for a prefix.
    fn interface_for(&self, prefix: Ipv6Addr) -> Option<Ipv6Addr>;
}

/// Persistent restart markers.
#[async_trait]
pub trait RestartInfoStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<u32>>;

    async fn set(&self, key: &str, value: u32) -> Result<()>;
}
