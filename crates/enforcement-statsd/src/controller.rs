//! Enforcement stats controller main loop.
//!
//! The controller owns every piece of mutable aggregation state and is driven
//! by a single event channel: the datapath reader forwards stats replies, the
//! reporting task forwards RPC completions, the scheduler forwards bootstrap
//! ticks. Nothing outside the loop mutates controller state.

use crate::aggregator::{build_session_states, UsageAggregator};
use crate::collaborators::{
    Datapath, PrefixResolver, RuleNumMapper, RuleVersionStore, SessionStateReporter, UsageReporter,
};
use crate::config::EnforcementConfig;
use crate::error::{EnforcementStatsError, Result};
use crate::flows::{FlowInstaller, FlowLifecycleManager};
use crate::msg_hub::MessageHub;
use crate::protocol::{FlowStat, StatsReply, SwitchMessage};
use crate::reply::{ReplyAggregator, ReplyOutcome};
use crate::reporter::{report_session_state, ReportingPipeline};
use crate::scheduler::{PollScheduler, SchedulerContext};
use crate::tables::constants::MSG_CHANNEL_TIMEOUT;
use crate::types::{UsageRecord, UsageRecordTable};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum ControllerEvent {
    /// One stats reply batch from the datapath.
    StatsReply(StatsReply),
    /// Completion of an upstream usage report.
    ReportDone {
        result: Result<()>,
        records: Vec<UsageRecord>,
    },
    /// Completion of a stale-flow reclamation pass.
    ReclaimDone { result: Result<usize> },
    /// Bootstrap tick: send an empty report.
    BootstrapReport,
    /// Overall setup is done; start accepting replies and polling.
    InitFinished,
    /// A (re)connected switch needs its default flow.
    DatapathConnected,
    DatapathDisconnected,
    /// Last aggregated usage, for introspection.
    GetPolicyUsage(oneshot::Sender<UsageRecordTable>),
    /// On-demand counters of flows whose cookie matches under `cookie_mask`.
    GetStats {
        cookie: u64,
        cookie_mask: u64,
        reply: StatsResponder,
    },
    Shutdown,
}

pub type StatsResponder = oneshot::Sender<Result<UsageRecordTable>>;

pub type EventSender = mpsc::UnboundedSender<ControllerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ControllerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Collaborators wired into the controller.
pub struct ControllerDeps {
    pub datapath: Arc<dyn Datapath>,
    pub hub: Arc<MessageHub>,
    pub reporter: Arc<dyn UsageReporter>,
    pub session_reporter: Option<Arc<dyn SessionStateReporter>>,
    pub versions: Arc<dyn RuleVersionStore>,
    pub rule_mapper: Arc<dyn RuleNumMapper>,
    pub prefixes: Arc<dyn PrefixResolver>,
}

pub struct EnforcementStatsController {
    config: EnforcementConfig,
    datapath: Arc<dyn Datapath>,
    hub: Arc<MessageHub>,
    flows: Arc<FlowLifecycleManager>,
    aggregator: UsageAggregator,
    replies: ReplyAggregator,
    pipeline: ReportingPipeline,
    session_reporter: Option<Arc<dyn SessionStateReporter>>,
    last_usage: UsageRecordTable,
    /// On-demand stats requests by xid.
    stats_requests: HashMap<u32, StatsResponder>,
    reclaiming: bool,
    init_finished: watch::Sender<bool>,
    last_report: watch::Sender<Instant>,
    events_tx: EventSender,
    events_rx: EventReceiver,
}

impl EnforcementStatsController {
    /// `switch_restarted` sets the version-resync flag on every report of
    /// this process.
    pub fn new(
        config: EnforcementConfig,
        deps: ControllerDeps,
        (events_tx, events_rx): (EventSender, EventReceiver),
        switch_restarted: bool,
    ) -> Self {
        let tbl_num = config.enforcement.table_number;
        let epoch = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);

        let flows = Arc::new(FlowLifecycleManager::new(
            tbl_num,
            Arc::clone(&deps.datapath),
            Arc::clone(&deps.hub),
            Arc::clone(&deps.rule_mapper),
            deps.versions,
        ));
        let aggregator = UsageAggregator::new(
            tbl_num,
            config.enforcement.default_drop_flow_name.clone(),
            deps.rule_mapper,
            deps.prefixes,
        );
        let pipeline =
            ReportingPipeline::new(deps.reporter, events_tx.clone(), epoch, switch_restarted)
                .with_payload_printing(config.print_grpc_payload);

        let (init_finished, _) = watch::channel(false);
        let (last_report, _) = watch::channel(Instant::now());

        Self {
            replies: ReplyAggregator::new(deps.datapath.datapath_id()),
            last_usage: pipeline.empty_table(),
            stats_requests: HashMap::new(),
            reclaiming: false,
            config,
            datapath: deps.datapath,
            hub: deps.hub,
            flows,
            aggregator,
            pipeline,
            session_reporter: deps.session_reporter,
            init_finished,
            last_report,
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            events: self.events_tx.clone(),
            flows: Arc::clone(&self.flows),
        }
    }

    pub fn flows(&self) -> &Arc<FlowLifecycleManager> {
        &self.flows
    }

    pub fn is_init_finished(&self) -> bool {
        *self.init_finished.borrow()
    }

    pub fn unmatched_bytes(&self) -> u64 {
        self.aggregator.unmatched_bytes()
    }

    /// Last aggregated usage table.
    pub fn policy_usage(&self) -> &UsageRecordTable {
        &self.last_usage
    }

    pub fn epoch(&self) -> u64 {
        self.pipeline.epoch()
    }

    /// Binds reply handling to the connected datapath and installs the
    /// table's default flow.
    pub async fn initialize_on_connect(&mut self) -> Result<()> {
        self.replies.rebind(self.datapath.datapath_id());
        self.flows
            .initialize_on_connect(self.config.clean_restart)
            .await
    }

    pub fn cleanup_state(&mut self) {
        self.replies.reset();
        self.aggregator.reset();
        self.last_usage = self.pipeline.empty_table();
        for (_, reply) in self.stats_requests.drain() {
            let _ = reply.send(Err(EnforcementStatsError::transport(
                "datapath disconnected",
            )));
        }
    }

    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let ctx = SchedulerContext {
            datapath: Arc::clone(&self.datapath),
            hub: Arc::clone(&self.hub),
            events: self.events_tx.clone(),
            init_finished: self.init_finished.subscribe(),
            last_report: self.last_report.subscribe(),
            tbl_num: self.config.enforcement.table_number,
            periodic: self.config.enforcement.periodic_stats_reporting,
        };
        tokio::spawn(PollScheduler::new(self.config.poll_interval(), Instant::now()).run(ctx))
    }

    /// Drains events until shutdown.
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        info!("Enforcement stats controller stopped");
    }

    /// Handles one event; returns false on shutdown.
    pub async fn handle_event(&mut self, event: ControllerEvent) -> bool {
        match event {
            ControllerEvent::StatsReply(reply) => self.on_stats_reply(reply),
            ControllerEvent::ReportDone { result, records } => {
                self.on_report_done(result, records)
            }
            ControllerEvent::ReclaimDone { result } => self.on_reclaim_done(result),
            ControllerEvent::BootstrapReport => self.pipeline.report(self.pipeline.empty_table()),
            ControllerEvent::InitFinished => {
                info!("Setup finished, accepting stats replies");
                self.init_finished.send_replace(true);
            }
            ControllerEvent::DatapathConnected => self.on_connect().await,
            ControllerEvent::DatapathDisconnected => self.on_disconnect().await,
            ControllerEvent::GetPolicyUsage(reply) => {
                let _ = reply.send(self.last_usage.clone());
            }
            ControllerEvent::GetStats {
                cookie,
                cookie_mask,
                reply,
            } => self.on_get_stats(cookie, cookie_mask, reply).await,
            ControllerEvent::Shutdown => return false,
        }
        true
    }

    fn on_stats_reply(&mut self, reply: StatsReply) {
        if !self.is_init_finished() {
            debug!("Setup not finished, skipping stats reply");
            return;
        }

        let xid = reply.xid;
        let outcome = self.replies.on_reply(reply);
        if let Some(responder) = self.take_stats_request(xid, &outcome) {
            let stats = match outcome {
                ReplyOutcome::Complete(stats) => stats,
                _ => Vec::new(),
            };
            self.on_stats_request_complete(stats, responder);
            return;
        }

        match outcome {
            ReplyOutcome::Complete(stats) => self.on_complete_batch(stats),
            ReplyOutcome::Empty => debug!("Stats reply carried no flows"),
            ReplyOutcome::Pending | ReplyOutcome::Discarded => {}
        }
    }

    fn take_stats_request(&mut self, xid: u32, outcome: &ReplyOutcome) -> Option<StatsResponder> {
        match outcome {
            ReplyOutcome::Complete(_) | ReplyOutcome::Empty => self.stats_requests.remove(&xid),
            ReplyOutcome::Pending | ReplyOutcome::Discarded => None,
        }
    }

    async fn on_get_stats(&mut self, cookie: u64, cookie_mask: u64, reply: StatsResponder) {
        // callers that timed out are gone
        self.stats_requests.retain(|_, pending| !pending.is_closed());

        let xid = self.hub.next_xid();
        let request = SwitchMessage::StatsRequest {
            xid,
            table_id: self.config.enforcement.table_number,
            cookie,
            cookie_mask,
        };
        match self.datapath.send(request).await {
            Ok(()) => {
                debug!(xid, cookie, cookie_mask, "Requested on-demand flow stats");
                self.stats_requests.insert(xid, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// On-demand results go to the caller only; superseded flows among them
    /// are still reclaimed.
    fn on_stats_request_complete(&mut self, stats: Vec<FlowStat>, reply: StatsResponder) {
        let result = self
            .aggregator
            .aggregate(&stats)
            .map(|usage| self.pipeline.build_table(usage));
        if let Ok(table) = &result {
            self.spawn_reclamation(table.records.clone());
        }
        let _ = reply.send(result);
    }

    fn on_complete_batch(&mut self, stats: Vec<FlowStat>) {
        debug!(flows = stats.len(), "Processing flow stats");

        let usage = match self.aggregator.aggregate(&stats) {
            Ok(usage) => usage,
            Err(e) => {
                error!(error = %e, "Failed processing stats, dropping this cycle");
                return;
            }
        };

        // empty tables are reported too: they tell upstream no flows are active
        let table = self.pipeline.build_table(usage);
        self.pipeline.report(table.clone());
        self.last_usage = table;

        if self.config.enable5g_features {
            if let Some(reporter) = &self.session_reporter {
                let sessions =
                    build_session_states(&stats, self.config.enforcement.table_number);
                report_session_state(
                    Arc::clone(reporter),
                    sessions,
                    self.config.print_grpc_payload,
                );
            }
        }
    }

    fn on_report_done(&mut self, result: Result<()>, records: Vec<UsageRecord>) {
        if let Err(e) = result {
            error!(error = %e, "Usage report failed, superseded flows kept");
            return;
        }

        self.last_report.send_replace(Instant::now());
        self.spawn_reclamation(records);
    }

    /// Deletes superseded flows off the main loop; one pass at a time.
    fn spawn_reclamation(&mut self, records: Vec<UsageRecord>) {
        if records.is_empty() {
            return;
        }
        if self.reclaiming {
            debug!("Reclamation pass still running, leaving stale flows for the next cycle");
            return;
        }
        self.reclaiming = true;

        let flows = Arc::clone(&self.flows);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = flows.delete_stale(&records).await;
            let _ = events.send(ControllerEvent::ReclaimDone { result });
        });
    }

    fn on_reclaim_done(&mut self, result: Result<usize>) {
        self.reclaiming = false;
        match result {
            Ok(0) => {}
            Ok(reclaimed) => debug!(reclaimed, "Reclaimed superseded rule flows"),
            Err(e) if e.is_storage_unavailable() => {
                error!(error = %e, "Failed to remove old flows, storage unavailable")
            }
            Err(e) => error!(error = %e, "Failed to remove old flows"),
        }
    }

    async fn on_connect(&mut self) {
        info!(
            datapath_id = self.datapath.datapath_id(),
            "Datapath connected, reinstalling default flow"
        );
        if let Err(e) = self.initialize_on_connect().await {
            error!(error = %e, "Failed to initialize datapath");
        }
    }

    /// Pending directives were already failed by the datapath itself.
    async fn on_disconnect(&mut self) {
        info!("Datapath disconnected, clearing controller state");
        self.cleanup_state();
        if let Err(e) = self
            .flows
            .cleanup_on_disconnect(self.config.clean_restart)
            .await
        {
            warn!(error = %e, "Could not flush table on disconnect");
        }
    }
}

/// Cloneable entry point for code outside the main loop.
#[derive(Clone)]
pub struct ControllerHandle {
    events: EventSender,
    flows: Arc<FlowLifecycleManager>,
}

impl ControllerHandle {
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Flow installer for the policy application layer. Calls block until
    /// the switch acknowledges or the message channel times out.
    pub fn flows(&self) -> &Arc<FlowLifecycleManager> {
        &self.flows
    }

    pub fn finish_init(&self) -> bool {
        self.events.send(ControllerEvent::InitFinished).is_ok()
    }

    /// Counters of flows matching `cookie` under `cookie_mask`, aggregated.
    pub async fn get_stats(&self, cookie: u64, cookie_mask: u64) -> Result<UsageRecordTable> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(ControllerEvent::GetStats {
                cookie,
                cookie_mask,
                reply: tx,
            })
            .map_err(|_| EnforcementStatsError::transport("controller stopped"))?;
        match tokio::time::timeout(MSG_CHANNEL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EnforcementStatsError::transport("controller stopped")),
            Err(_) => Err(EnforcementStatsError::transport(format!(
                "no stats reply within {:?}",
                MSG_CHANNEL_TIMEOUT
            ))),
        }
    }

    pub async fn policy_usage(&self) -> Result<UsageRecordTable> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(ControllerEvent::GetPolicyUsage(tx))
            .map_err(|_| EnforcementStatsError::transport("controller stopped"))?;
        rx.await
            .map_err(|_| EnforcementStatsError::transport("controller stopped"))
    }

    pub fn shutdown(&self) -> bool {
        self.events.send(ControllerEvent::Shutdown).is_ok()
    }
}
