//! Asynchronous usage reporting.
//!
//! Reports run on their own task; the completion comes back to the main loop
//! as [`ControllerEvent::ReportDone`], which decides on stale-flow reclamation.

use crate::aggregator::UsageMap;
use crate::collaborators::{SessionStateReporter, UsageReporter};
use crate::controller::ControllerEvent;
use crate::error::EnforcementStatsError;
use crate::tables::constants::SESSIOND_RPC_TIMEOUT;
use crate::types::{NgSessionState, UsageRecordTable};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct ReportingPipeline {
    reporter: Arc<dyn UsageReporter>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    epoch: u64,
    update_rule_versions: bool,
    print_payload: bool,
}

impl ReportingPipeline {
    pub fn new(
        reporter: Arc<dyn UsageReporter>,
        events: mpsc::UnboundedSender<ControllerEvent>,
        epoch: u64,
        update_rule_versions: bool,
    ) -> Self {
        Self {
            reporter,
            events,
            epoch,
            update_rule_versions,
            print_payload: false,
        }
    }

    pub fn with_payload_printing(mut self, enabled: bool) -> Self {
        self.print_payload = enabled;
        self
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn build_table(&self, usage: UsageMap) -> UsageRecordTable {
        UsageRecordTable::new(
            usage.into_values().collect(),
            self.epoch,
            self.update_rule_versions,
        )
    }

    pub fn empty_table(&self) -> UsageRecordTable {
        UsageRecordTable::empty(self.epoch, self.update_rule_versions)
    }

    /// Sends `table` upstream, empty or not. Returns immediately.
    pub fn report(&self, table: UsageRecordTable) {
        if self.print_payload {
            info!(payload = ?table, "Sending usage report");
        }

        let reporter = Arc::clone(&self.reporter);
        let events = self.events.clone();
        tokio::spawn(async move {
            let records = table.records.clone();
            let result =
                match tokio::time::timeout(SESSIOND_RPC_TIMEOUT, reporter.report_rule_stats(table))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EnforcementStatsError::upstream(format!(
                        "no response within {:?}",
                        SESSIOND_RPC_TIMEOUT
                    ))),
                };
            // controller gone means shutdown; nothing to reclaim
            let _ = events.send(ControllerEvent::ReportDone { result, records });
        });
    }
}

/// Sends 5G session state; failures are only logged.
pub fn report_session_state(
    reporter: Arc<dyn SessionStateReporter>,
    sessions: HashMap<u32, NgSessionState>,
    print_payload: bool,
) {
    if print_payload {
        info!(payload = ?sessions, "Sending session state report");
    }
    tokio::spawn(async move {
        match tokio::time::timeout(SESSIOND_RPC_TIMEOUT, reporter.report_session_state(sessions))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Session state report failed"),
            Err(_) => error!("Session state report timed out"),
        }
    });
}
