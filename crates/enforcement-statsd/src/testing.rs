//! Recording fakes for unit tests.

use crate::collaborators::{
    Datapath, MappingStore, RuleVersionStore, SessionStateReporter, UsageReporter,
};
use crate::error::{EnforcementStatsError, Result};
use crate::msg_hub::MessageHub;
use crate::protocol::{FlowMod, SwitchMessage};
use crate::types::{NgSessionState, UsageRecordTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Records every message; optionally answers barriers through a hub.
pub struct RecordingDatapath {
    id: u64,
    sent: Mutex<Vec<SwitchMessage>>,
    connected: AtomicBool,
    reject: AtomicBool,
    hub: Option<Arc<MessageHub>>,
}

impl RecordingDatapath {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            reject: AtomicBool::new(false),
            hub: None,
        }
    }

    /// Acknowledges every barrier immediately.
    pub fn acking(id: u64, hub: Arc<MessageHub>) -> Self {
        Self {
            hub: Some(hub),
            ..Self::new(id)
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Answers subsequent flow-mods with a switch error.
    pub fn reject_flow_mods(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SwitchMessage> {
        self.sent.lock().clone()
    }

    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
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
impl Datapath for RecordingDatapath {
    fn datapath_id(&self) -> u64 {
        self.id
    }

    async fn send(&self, msg: SwitchMessage) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EnforcementStatsError::transport("datapath disconnected"));
        }
        self.sent.lock().push(msg.clone());
        if let Some(hub) = &self.hub {
            match msg {
                SwitchMessage::FlowMod { xid, .. } if self.reject.load(Ordering::SeqCst) => {
                    hub.handle_error(xid, 4, "bad match");
                }
                SwitchMessage::Barrier { xid } => {
                    hub.handle_barrier(xid);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Version store backed by a map keyed on (sid, rule_id).
#[derive(Default)]
pub struct FakeVersionStore {
    versions: Mutex<HashMap<(String, String), u64>>,
    unavailable: AtomicBool,
}

impl FakeVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current(&self, sid: &str, rule_id: &str, version: u64) {
        self.versions
            .lock()
            .insert((sid.to_string(), rule_id.to_string()), version);
    }

    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuleVersionStore for FakeVersionStore {
    async fn get_current_version(
        &self,
        sid: &str,
        _ip: Option<IpAddr>,
        rule_id: &str,
    ) -> Result<u64> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EnforcementStatsError::storage("hget", "connection refused"));
        }
        Ok(self
            .versions
            .lock()
            .get(&(sid.to_string(), rule_id.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn set_version(
        &self,
        sid: &str,
        _ip: Option<IpAddr>,
        rule_id: &str,
        version: u64,
    ) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EnforcementStatsError::storage("hset", "connection refused"));
        }
        self.set_current(sid, rule_id, version);
        Ok(())
    }
}

/// Mapping store kept in memory; survives mapper reloads within a test.
#[derive(Default)]
pub struct MemoryMappingStore {
    rule_nums: Mutex<HashMap<String, u32>>,
    prefixes: Mutex<HashMap<Ipv6Addr, Ipv6Addr>>,
    unavailable: AtomicBool,
}

impl MemoryMappingStore {
    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EnforcementStatsError::storage(operation, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn rule_nums(&self) -> Result<Vec<(String, u32)>> {
        self.check("hgetall")?;
        Ok(self
            .rule_nums
            .lock()
            .iter()
            .map(|(id, num)| (id.clone(), *num))
            .collect())
    }

    async fn save_rule_num(&self, rule_id: &str, rule_num: u32) -> Result<()> {
        self.check("hset")?;
        self.rule_nums.lock().insert(rule_id.to_string(), rule_num);
        Ok(())
    }

    async fn prefixes(&self) -> Result<Vec<(Ipv6Addr, Ipv6Addr)>> {
        self.check("hgetall")?;
        Ok(self.prefixes.lock().iter().map(|(p, i)| (*p, *i)).collect())
    }

    async fn save_prefix(&self, prefix: Ipv6Addr, interface: Ipv6Addr) -> Result<()> {
        self.check("hset")?;
        self.prefixes.lock().insert(prefix, interface);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: Ipv6Addr) -> Result<()> {
        self.check("hdel")?;
        self.prefixes.lock().remove(&prefix);
        Ok(())
    }
}

/// Records reported tables and session maps.
#[derive(Default)]
pub struct RecordingReporter {
    tables: Mutex<Vec<UsageRecordTable>>,
    sessions: Mutex<Vec<HashMap<u32, NgSessionState>>>,
    reject: AtomicBool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_reports(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn tables(&self) -> Vec<UsageRecordTable> {
        self.tables.lock().clone()
    }

    pub fn sessions(&self) -> Vec<HashMap<u32, NgSessionState>> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl UsageReporter for RecordingReporter {
    async fn report_rule_stats(&self, table: UsageRecordTable) -> Result<()> {
        self.tables.lock().push(table);
        if self.reject.load(Ordering::SeqCst) {
            return Err(EnforcementStatsError::upstream("status 503"));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStateReporter for RecordingReporter {
    async fn report_session_state(&self, sessions: HashMap<u32, NgSessionState>) -> Result<()> {
        self.sessions.lock().push(sessions);
        Ok(())
    }
}
