//! Redis-backed restart markers, rule versions and rule/prefix mappings.

use crate::collaborators::{MappingStore, RestartInfoStore, RuleVersionStore};
use crate::error::{EnforcementStatsError, Result};
use crate::tables::{
    IPV6_PREFIX_TABLE_NAME, RESTART_INFO_TABLE_NAME, RULE_IDS_TABLE_NAME, RULE_NUMS_TABLE_NAME,
    RULE_VERSION_TABLE_NAME,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use tracing::{debug, instrument, warn};

fn storage_error(operation: &str) -> impl FnOnce(RedisError) -> EnforcementStatsError + '_ {
    move |e| EnforcementStatsError::storage(operation, e.to_string())
}

/// Hash field of a rule version: `sid|ip|rule_id`, ip empty when absent.
pub fn rule_version_field(sid: &str, ip: Option<IpAddr>, rule_id: &str) -> String {
    match ip {
        Some(ip) => format!("{}|{}|{}", sid, ip, rule_id),
        None => format!("{}||{}", sid, rule_id),
    }
}

/// Parses stored `prefix -> interface` pairs, skipping malformed entries.
fn parse_prefixes(raw: HashMap<String, String>) -> Vec<(Ipv6Addr, Ipv6Addr)> {
    raw.into_iter()
        .filter_map(|(prefix, interface)| {
            match (prefix.parse::<Ipv6Addr>(), interface.parse::<Ipv6Addr>()) {
                (Ok(p), Ok(i)) => Some((p, i)),
                _ => {
                    warn!(%prefix, %interface, "Skipping malformed prefix mapping");
                    None
                }
            }
        })
        .collect()
}

/// All stores share one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self> {
        debug!("Connecting to Redis");
        let client = Client::open(url).map_err(storage_error("open"))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(storage_error("connect"))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RuleVersionStore for RedisStore {
    #[instrument(skip(self))]
    async fn get_current_version(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        rule_id: &str,
    ) -> Result<u64> {
        let mut conn = self.conn.clone();
        let field = rule_version_field(sid, ip, rule_id);
        let version: Option<u64> = conn
            .hget(RULE_VERSION_TABLE_NAME, &field)
            .await
            .map_err(storage_error("hget"))?;
        Ok(version.unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn set_version(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        rule_id: &str,
        version: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let field = rule_version_field(sid, ip, rule_id);
        let _: () = conn
            .hset(RULE_VERSION_TABLE_NAME, &field, version)
            .await
            .map_err(storage_error("hset"))?;
        Ok(())
    }
}

#[async_trait]
impl MappingStore for RedisStore {
    async fn rule_nums(&self) -> Result<Vec<(String, u32)>> {
        let mut conn = self.conn.clone();
        let nums: HashMap<String, u32> = conn
            .hgetall(RULE_NUMS_TABLE_NAME)
            .await
            .map_err(storage_error("hgetall"))?;
        Ok(nums.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn save_rule_num(&self, rule_id: &str, rule_num: u32) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(RULE_NUMS_TABLE_NAME, rule_id, rule_num)
            .ignore()
            .hset(RULE_IDS_TABLE_NAME, rule_num, rule_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(storage_error("hset"))?;
        Ok(())
    }

    async fn prefixes(&self) -> Result<Vec<(Ipv6Addr, Ipv6Addr)>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(IPV6_PREFIX_TABLE_NAME)
            .await
            .map_err(storage_error("hgetall"))?;
        Ok(parse_prefixes(raw))
    }

    #[instrument(skip(self))]
    async fn save_prefix(&self, prefix: Ipv6Addr, interface: Ipv6Addr) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                IPV6_PREFIX_TABLE_NAME,
                prefix.to_string(),
                interface.to_string(),
            )
            .await
            .map_err(storage_error("hset"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_prefix(&self, prefix: Ipv6Addr) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(IPV6_PREFIX_TABLE_NAME, prefix.to_string())
            .await
            .map_err(storage_error("hdel"))?;
        Ok(())
    }
}

#[async_trait]
impl RestartInfoStore for RedisStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<u32>> {
        let mut conn = self.conn.clone();
        conn.hget(RESTART_INFO_TABLE_NAME, key)
            .await
            .map_err(storage_error("hget"))
    }

    #[instrument(skip(self))]
    async fn set(&self, key: &str, value: u32) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(RESTART_INFO_TABLE_NAME, key, value)
            .await
            .map_err(storage_error("hset"))?;
        Ok(())
    }
}
