//! Rule number and IPv6 prefix mappers.
//!
//! Both keep the full mapping in memory for the aggregation hot path and
//! write new entries through to a [`MappingStore`] when one is attached.

use crate::collaborators::{MappingStore, PrefixResolver, RuleNumMapper};
use crate::error::{EnforcementStatsError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RuleMaps {
    by_id: HashMap<String, u32>,
    by_num: HashMap<u32, String>,
    next: u32,
}

impl RuleMaps {
    fn insert(&mut self, rule_id: &str, num: u32) {
        self.by_id.insert(rule_id.to_string(), num);
        self.by_num.insert(num, rule_id.to_string());
        self.next = self.next.max(num);
    }
}

/// Bidirectional rule id <-> rule number map.
///
/// Numbers start at 1; 0 is reserved for per-subscriber default flows.
#[derive(Default)]
pub struct RuleIdMapper {
    maps: RwLock<RuleMaps>,
    store: Option<Arc<dyn MappingStore>>,
}

impl RuleIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores every stored mapping; new numbers continue after the
    /// highest one seen.
    pub async fn load(store: Arc<dyn MappingStore>) -> Result<Self> {
        let mut maps = RuleMaps::default();
        for (rule_id, num) in store.rule_nums().await? {
            if num == 0 {
                warn!(rule_id, "Ignoring stored rule number 0");
                continue;
            }
            maps.insert(&rule_id, num);
        }
        info!(rules = maps.by_id.len(), "Loaded rule number mappings");
        Ok(Self {
            maps: RwLock::new(maps),
            store: Some(store),
        })
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&self, rule_id: &str) -> Result<(u32, bool)> {
        let mut maps = self.maps.write();
        // raced with another writer
        if let Some(num) = maps.by_id.get(rule_id) {
            return Ok((*num, false));
        }
        let num = maps.next.checked_add(1).ok_or_else(|| {
            EnforcementStatsError::resolution("rule number space for", rule_id)
        })?;
        maps.insert(rule_id, num);
        Ok((num, true))
    }

    fn forget(&self, rule_id: &str, num: u32) {
        let mut maps = self.maps.write();
        maps.by_id.remove(rule_id);
        maps.by_num.remove(&num);
    }
}

#[async_trait]
impl RuleNumMapper for RuleIdMapper {
    fn rule_id(&self, rule_num: u32) -> Result<String> {
        self.maps
            .read()
            .by_num
            .get(&rule_num)
            .cloned()
            .ok_or_else(|| EnforcementStatsError::resolution("rule number", rule_num))
    }

    async fn get_or_create_rule_num(&self, rule_id: &str) -> Result<u32> {
        if let Some(num) = self.maps.read().by_id.get(rule_id) {
            return Ok(*num);
        }

        let (num, created) = self.allocate(rule_id)?;
        if let (true, Some(store)) = (created, &self.store) {
            if let Err(e) = store.save_rule_num(rule_id, num).await {
                // an unpersisted number must not end up in a flow
                self.forget(rule_id, num);
                return Err(e);
            }
            debug!(rule_id, num, "Persisted new rule number");
        }
        Ok(num)
    }
}

/// /64 prefix -> interface host-id map.
#[derive(Default)]
pub struct PrefixMapper {
    interfaces: RwLock<HashMap<Ipv6Addr, Ipv6Addr>>,
    store: Option<Arc<dyn MappingStore>>,
}

impl PrefixMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: Arc<dyn MappingStore>) -> Result<Self> {
        let interfaces: HashMap<_, _> = store.prefixes().await?.into_iter().collect();
        info!(prefixes = interfaces.len(), "Loaded IPv6 prefix mappings");
        Ok(Self {
            interfaces: RwLock::new(interfaces),
            store: Some(store),
        })
    }

    /// Registers the prefix and interface id of a UE address.
    pub async fn register_ue(&self, ue_ip: Ipv6Addr) -> Result<()> {
        let prefix = self.prefix_for(ue_ip);
        let interface = Ipv6Addr::from(u128::from(ue_ip) & !u128::from(prefix_mask()));
        self.register(prefix, interface).await
    }

    pub async fn register(&self, prefix: Ipv6Addr, interface: Ipv6Addr) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_prefix(prefix, interface).await?;
        }
        self.interfaces.write().insert(prefix, interface);
        Ok(())
    }

    pub async fn remove(&self, prefix: Ipv6Addr) -> Result<Option<Ipv6Addr>> {
        if let Some(store) = &self.store {
            store.remove_prefix(prefix).await?;
        }
        Ok(self.interfaces.write().remove(&prefix))
    }
}

fn prefix_mask() -> Ipv6Addr {
    Ipv6Addr::from(u128::MAX << 64)
}

impl PrefixResolver for PrefixMapper {
    fn interface_for(&self, prefix: Ipv6Addr) -> Option<Ipv6Addr> {
        self.interfaces.read().get(&prefix).copied()
    }
}
