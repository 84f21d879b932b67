//! Shared fakes for controller integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use enforcement_statsd::codec::RuleMatch;
use enforcement_statsd::collaborators::{
    Datapath, MappingStore, RuleVersionStore, SessionStateReporter, UsageReporter,
};
use enforcement_statsd::controller::event_channel;
use enforcement_statsd::datapath::DatapathSlot;
use enforcement_statsd::msg_hub::MessageHub;
use enforcement_statsd::protocol::{FlowMod, FlowStat, StatsReply, SwitchMessage};
use enforcement_statsd::{
    ControllerDeps, EnforcementConfig, EnforcementStatsController, EnforcementStatsError,
    NgSessionState, PrefixMapper, Result, RuleIdMapper, UsageRecordTable,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DATAPATH_ID: u64 = 0x42;
pub const TABLE: u8 = 12;
pub const SID: &str = "IMSI001010000000001";

/// Acknowledges every barrier and records flow-mods.
pub struct SwitchFake {
    id: u64,
    hub: Arc<MessageHub>,
    sent: Mutex<Vec<SwitchMessage>>,
}

impl SwitchFake {
    pub fn new(id: u64, hub: Arc<MessageHub>) -> Self {
        Self {
            id,
            hub,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SwitchMessage> {
        self.sent.lock().clone()
    }

    /// Transaction id of the most recent stats request.
    pub fn stats_request_xid(&self) -> Option<u32> {
        self.sent.lock().iter().rev().find_map(|m| match m {
            SwitchMessage::StatsRequest { xid, .. } => Some(*xid),
            _ => None,
        })
    }

    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                SwitchMessage::FlowMod { flow_mod, .. } => Some(flow_mod.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Datapath for SwitchFake {
    fn datapath_id(&self) -> u64 {
        self.id
    }

    async fn send(&self, msg: SwitchMessage) -> Result<()> {
        if let SwitchMessage::Barrier { xid } = msg {
            self.hub.handle_barrier(xid);
        }
        self.sent.lock().push(msg);
        Ok(())
    }
}

#[derive(Default)]
pub struct Versions {
    current: Mutex<HashMap<String, u64>>,
}

impl Versions {
    pub fn set(&self, rule_id: &str, version: u64) {
        self.current.lock().insert(rule_id.to_string(), version);
    }

    pub fn current(&self, rule_id: &str) -> Option<u64> {
        self.current.lock().get(rule_id).copied()
    }
}

#[async_trait]
impl RuleVersionStore for Versions {
    async fn get_current_version(&self, _sid: &str, _ip: Option<IpAddr>, rule_id: &str) -> Result<u64> {
        Ok(self.current.lock().get(rule_id).copied().unwrap_or(0))
    }

    async fn set_version(
        &self,
        _sid: &str,
        _ip: Option<IpAddr>,
        rule_id: &str,
        version: u64,
    ) -> Result<()> {
        self.set(rule_id, version);
        Ok(())
    }
}

/// Mapping store that outlives a harness, standing in for redis across a
/// daemon restart.
#[derive(Default)]
pub struct Mappings {
    rule_nums: Mutex<HashMap<String, u32>>,
    prefixes: Mutex<HashMap<Ipv6Addr, Ipv6Addr>>,
}

#[async_trait]
impl MappingStore for Mappings {
    async fn rule_nums(&self) -> Result<Vec<(String, u32)>> {
        Ok(self
            .rule_nums
            .lock()
            .iter()
            .map(|(id, num)| (id.clone(), *num))
            .collect())
    }

    async fn save_rule_num(&self, rule_id: &str, rule_num: u32) -> Result<()> {
        self.rule_nums.lock().insert(rule_id.to_string(), rule_num);
        Ok(())
    }

    async fn prefixes(&self) -> Result<Vec<(Ipv6Addr, Ipv6Addr)>> {
        Ok(self.prefixes.lock().iter().map(|(p, i)| (*p, *i)).collect())
    }

    async fn save_prefix(&self, prefix: Ipv6Addr, interface: Ipv6Addr) -> Result<()> {
        self.prefixes.lock().insert(prefix, interface);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: Ipv6Addr) -> Result<()> {
        self.prefixes.lock().remove(&prefix);
        Ok(())
    }
}

#[derive(Default)]
pub struct Upstream {
    pub tables: Mutex<Vec<UsageRecordTable>>,
    pub sessions: Mutex<Vec<HashMap<u32, NgSessionState>>>,
    pub reject: AtomicBool,
}

#[async_trait]
impl UsageReporter for Upstream {
    async fn report_rule_stats(&self, table: UsageRecordTable) -> Result<()> {
        self.tables.lock().push(table);
        if self.reject.load(Ordering::SeqCst) {
            return Err(EnforcementStatsError::upstream("status 500"));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStateReporter for Upstream {
    async fn report_session_state(&self, sessions: HashMap<u32, NgSessionState>) -> Result<()> {
        self.sessions.lock().push(sessions);
        Ok(())
    }
}

pub struct Harness {
    pub controller: EnforcementStatsController,
    pub hub: Arc<MessageHub>,
    /// What the controller talks to; holds `switch` until a test swaps it.
    pub slot: Arc<DatapathSlot>,
    pub switch: Arc<SwitchFake>,
    pub versions: Arc<Versions>,
    pub upstream: Arc<Upstream>,
    pub rules: Arc<RuleIdMapper>,
    pub prefixes: Arc<PrefixMapper>,
}

pub fn harness(config: EnforcementConfig) -> Harness {
    assemble(
        config,
        Arc::new(RuleIdMapper::new()),
        Arc::new(PrefixMapper::new()),
    )
}

/// Harness whose mappers are restored from, and write through to, `store`.
pub async fn harness_with_store(config: EnforcementConfig, store: Arc<Mappings>) -> Harness {
    let rules = RuleIdMapper::load(store.clone()).await.unwrap();
    let prefixes = PrefixMapper::load(store).await.unwrap();
    assemble(config, Arc::new(rules), Arc::new(prefixes))
}

fn assemble(
    config: EnforcementConfig,
    rules: Arc<RuleIdMapper>,
    prefixes: Arc<PrefixMapper>,
) -> Harness {
    let hub = Arc::new(MessageHub::new(Duration::from_secs(5)));
    let switch = Arc::new(SwitchFake::new(DATAPATH_ID, hub.clone()));
    let slot = Arc::new(DatapathSlot::new());
    slot.set(switch.clone());
    let versions = Arc::new(Versions::default());
    let upstream = Arc::new(Upstream::default());

    let deps = ControllerDeps {
        datapath: slot.clone(),
        hub: hub.clone(),
        reporter: upstream.clone(),
        session_reporter: Some(upstream.clone()),
        versions: versions.clone(),
        rule_mapper: rules.clone(),
        prefixes: prefixes.clone(),
    };
    Harness {
        controller: EnforcementStatsController::new(config, deps, event_channel(), false),
        hub,
        slot,
        switch,
        versions,
        upstream,
        rules,
        prefixes,
    }
}

pub fn counter(m: RuleMatch, bytes: u64, packets: u64) -> FlowStat {
    FlowStat {
        table_id: TABLE,
        cookie: 0,
        priority: 10,
        byte_count: bytes,
        packet_count: packets,
        flow_match: m.encode().expect("encodable match"),
    }
}

pub fn reply(more: bool, body: Vec<FlowStat>) -> StatsReply {
    StatsReply {
        datapath_id: DATAPATH_ID,
        xid: 1,
        more,
        body,
    }
}

/// Polls `cond` until it holds or a second passes.
pub async fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
