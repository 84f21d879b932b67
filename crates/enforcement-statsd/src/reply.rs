//! Multi-part stats reply reassembly.
//!
//! Batches are grouped by transaction id so a periodic poll and an on-demand
//! request can be in flight at the same time.

use crate::protocol::{FlowStat, StatsReply};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// No partial reply pending.
    Idle,
    /// Intermediate batches received, waiting for the last one.
    Collecting,
}

/// What to do with a reply batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// More batches follow.
    Pending,
    /// Last batch received; entries of every batch, in arrival order.
    Complete(Vec<FlowStat>),
    /// Last batch received but no entries at all.
    Empty,
    /// Reply from a switch other than the monitored one.
    Discarded,
}

#[derive(Debug)]
pub struct ReplyAggregator {
    datapath_id: u64,
    pending: HashMap<u32, Vec<FlowStat>>,
}

impl ReplyAggregator {
    pub fn new(datapath_id: u64) -> Self {
        Self {
            datapath_id,
            pending: HashMap::new(),
        }
    }

    pub fn state(&self) -> ReplyState {
        if self.pending.is_empty() {
            ReplyState::Idle
        } else {
            ReplyState::Collecting
        }
    }

    pub fn datapath_id(&self) -> u64 {
        self.datapath_id
    }

    /// Switches to a new datapath and drops anything pending.
    pub fn rebind(&mut self, datapath_id: u64) {
        self.datapath_id = datapath_id;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn on_reply(&mut self, reply: StatsReply) -> ReplyOutcome {
        if reply.datapath_id != self.datapath_id {
            debug!(
                expected = self.datapath_id,
                got = reply.datapath_id,
                "Ignoring stats reply from unexpected datapath"
            );
            return ReplyOutcome::Discarded;
        }

        if reply.more {
            self.pending.entry(reply.xid).or_default().extend(reply.body);
            return ReplyOutcome::Pending;
        }

        let mut stats = self.pending.remove(&reply.xid).unwrap_or_default();
        stats.extend(reply.body);
        if stats.is_empty() {
            ReplyOutcome::Empty
        } else {
            ReplyOutcome::Complete(stats)
        }
    }
}
