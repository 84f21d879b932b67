//! Monitoring flow installation and reclamation.
//!
//! [`FlowLifecycleManager`] is the single flow controller: it provides the
//! default flows ([`DefaultFlowProvider`]) and installs/deletes rule flows
//! ([`FlowInstaller`]). Every directive goes through the message hub and is
//! confirmed by a barrier before the call returns.

use crate::codec::RuleMatch;
use crate::collaborators::{Datapath, RuleNumMapper, RuleVersionStore};
use crate::error::Result;
use crate::msg_hub::MessageHub;
use crate::protocol::{FlowMatch, FlowMod};
use crate::tables::constants::DEFAULT_FLOW_COOKIE;
use crate::tables::priority;
use crate::types::{Direction, PolicyRule, RuleModResult, StatsClass, UsageRecord};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// A rule to meter for one subscriber session.
#[derive(Debug, Clone, Copy)]
pub struct RuleFlowRequest<'a> {
    pub sid: &'a str,
    pub ip: Option<IpAddr>,
    pub rule: &'a PolicyRule,
    pub version: u64,
    /// Used as the flow cookie.
    pub shard_id: u64,
    pub teid: u32,
}

/// Flows that exist independently of policy rules.
pub trait DefaultFlowProvider {
    /// Table-wide deny-all flow.
    fn default_flow_msgs(&self) -> Vec<FlowMod>;

    /// Per-subscriber default-drop flows, one per direction.
    fn subscriber_default_flow_msgs(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        teid: u32,
    ) -> Result<Vec<FlowMod>>;
}

#[async_trait]
pub trait FlowInstaller {
    async fn install_rule_flows(&self, req: &RuleFlowRequest<'_>) -> RuleModResult;

    async fn install_default_drop(&self, sid: &str, ip: Option<IpAddr>, teid: u32)
        -> RuleModResult;

    async fn delete_subscriber_flows(&self, sid: &str, ip: Option<IpAddr>, teid: u32)
        -> Result<()>;

    /// Deletes the flows of every record whose version is no longer current.
    /// Returns the number of records reclaimed.
    async fn delete_stale(&self, records: &[UsageRecord]) -> Result<usize>;
}

pub struct FlowLifecycleManager {
    tbl_num: u8,
    datapath: Arc<dyn Datapath>,
    hub: Arc<MessageHub>,
    rule_mapper: Arc<dyn RuleNumMapper>,
    versions: Arc<dyn RuleVersionStore>,
}

impl FlowLifecycleManager {
    pub fn new(
        tbl_num: u8,
        datapath: Arc<dyn Datapath>,
        hub: Arc<MessageHub>,
        rule_mapper: Arc<dyn RuleNumMapper>,
        versions: Arc<dyn RuleVersionStore>,
    ) -> Self {
        Self {
            tbl_num,
            datapath,
            hub,
            rule_mapper,
            versions,
        }
    }

    pub fn table_number(&self) -> u8 {
        self.tbl_num
    }

    /// Flushes the table when `clean_restart` is set, then installs the
    /// deny-all default flow.
    pub async fn initialize_on_connect(&self, clean_restart: bool) -> Result<()> {
        if clean_restart {
            self.delete_all_flows().await?;
        }
        self.send_and_wait(self.default_flow_msgs()).await?;
        info!(table = self.tbl_num, "Installed default deny-all flow");
        Ok(())
    }

    pub async fn cleanup_on_disconnect(&self, clean_restart: bool) -> Result<()> {
        if clean_restart {
            self.delete_all_flows().await?;
        }
        Ok(())
    }

    pub async fn delete_all_flows(&self) -> Result<()> {
        debug!(table = self.tbl_num, "Flushing table");
        self.send_and_wait(vec![FlowMod::delete_all(self.tbl_num)])
            .await
    }

    async fn rule_flow_msgs(&self, req: &RuleFlowRequest<'_>) -> Result<Vec<FlowMod>> {
        let rule_num = self.rule_mapper.get_or_create_rule_num(&req.rule.id).await?;
        let class = if req.rule.permits() {
            StatsClass::Measured
        } else {
            StatsClass::DropMeasured
        };

        let mut classes = vec![class];
        if req.rule.app_name.is_some() {
            classes.push(StatsClass::Ignored);
        }

        let mut msgs = Vec::with_capacity(classes.len() * 2);
        for class in classes {
            for direction in Direction::BOTH {
                let m = RuleMatch::new(req.sid, req.ip, rule_num, req.version, direction, req.teid)
                    .with_class(class)
                    .encode()?;
                msgs.push(FlowMod::add(
                    self.tbl_num,
                    priority::DEFAULT,
                    req.shard_id,
                    m,
                ));
            }
        }
        Ok(msgs)
    }

    fn rule_version_matches(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        rule_num: u32,
        version: u64,
        teid: u32,
    ) -> Result<Vec<FlowMatch>> {
        Direction::BOTH
            .into_iter()
            .map(|direction| RuleMatch::new(sid, ip, rule_num, version, direction, teid).encode())
            .collect()
    }

    async fn delete_rule_version(&self, record: &UsageRecord) -> Result<()> {
        let rule_num = self
            .rule_mapper
            .get_or_create_rule_num(&record.rule_id)
            .await?;
        let msgs = self
            .rule_version_matches(
                &record.sid,
                record.ue_ip(),
                rule_num,
                record.rule_version,
                record.teid.unwrap_or(0),
            )?
            .into_iter()
            .map(|m| FlowMod::delete(self.tbl_num, m))
            .collect();
        self.send_and_wait(msgs).await
    }

    async fn send_and_wait(&self, msgs: Vec<FlowMod>) -> Result<()> {
        self.hub
            .send(self.datapath.as_ref(), msgs)
            .await?
            .wait_all()
            .await
    }
}

impl DefaultFlowProvider for FlowLifecycleManager {
    fn default_flow_msgs(&self) -> Vec<FlowMod> {
        vec![FlowMod::add(
            self.tbl_num,
            priority::MINIMUM,
            DEFAULT_FLOW_COOKIE,
            FlowMatch::new(),
        )]
    }

    fn subscriber_default_flow_msgs(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        teid: u32,
    ) -> Result<Vec<FlowMod>> {
        Ok(self
            .rule_version_matches(sid, ip, 0, 0, teid)?
            .into_iter()
            .map(|m| FlowMod::add(self.tbl_num, priority::DROP, 0, m))
            .collect())
    }
}

#[async_trait]
impl FlowInstaller for FlowLifecycleManager {
    #[instrument(skip(self, req), fields(sid = req.sid, rule = %req.rule.id, version = req.version))]
    async fn install_rule_flows(&self, req: &RuleFlowRequest<'_>) -> RuleModResult {
        let result = async {
            let msgs = self.rule_flow_msgs(req).await?;
            self.send_and_wait(msgs).await?;
            self.versions
                .set_version(req.sid, req.ip, &req.rule.id, req.version)
                .await
        }
        .await;
        match result {
            Ok(()) => RuleModResult::Success,
            Err(e) => {
                error!(
                    sid = req.sid,
                    rule = %req.rule.id,
                    error = %e,
                    "Failed to install rule flows"
                );
                RuleModResult::Failure
            }
        }
    }

    async fn install_default_drop(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        teid: u32,
    ) -> RuleModResult {
        let result = match self.subscriber_default_flow_msgs(sid, ip, teid) {
            Ok(msgs) => self.send_and_wait(msgs).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => RuleModResult::Success,
            Err(e) => {
                error!(sid, error = %e, "Failed to install default drop flows");
                RuleModResult::Failure
            }
        }
    }

    async fn delete_subscriber_flows(
        &self,
        sid: &str,
        ip: Option<IpAddr>,
        teid: u32,
    ) -> Result<()> {
        let msgs = self
            .rule_version_matches(sid, ip, 0, 0, teid)?
            .into_iter()
            .map(|m| FlowMod::delete(self.tbl_num, m))
            .collect();
        self.send_and_wait(msgs).await
    }

    async fn delete_stale(&self, records: &[UsageRecord]) -> Result<usize> {
        let mut reclaimed = 0;
        for record in records {
            let current = self
                .versions
                .get_current_version(&record.sid, record.ue_ip(), &record.rule_id)
                .await?;
            if current == record.rule_version {
                continue;
            }

            match self.delete_rule_version(record).await {
                Ok(()) => {
                    debug!(
                        sid = %record.sid,
                        rule = %record.rule_id,
                        version = record.rule_version,
                        current,
                        "Deleted superseded rule flows"
                    );
                    reclaimed += 1;
                }
                Err(e) => error!(
                    sid = %record.sid,
                    rule = %record.rule_id,
                    version = record.rule_version,
                    error = %e,
                    "Failed to delete superseded rule flows"
                ),
            }
        }
        Ok(reclaimed)
    }
}
