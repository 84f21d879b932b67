//! # enforcement-statsd - Policy Usage Metering Daemon
//!
//! Installs monitoring-only flows keyed by subscriber, policy rule, direction
//! and rule version, periodically polls the switch for their counters, and
//! reports per-subscriber per-rule usage upstream. Once a report is
//! acknowledged, flows of superseded rule versions are deleted.
//!
//! ## Components
//! - [`codec`]: match field encoding of flow identity, counter entry decoding
//! - [`reply::ReplyAggregator`]: multi-part stats reply reassembly
//! - [`aggregator::UsageAggregator`]: counter entries to usage records
//! - [`scheduler::PollScheduler`]: drift-tolerant polling with bootstrap phase
//! - [`reporter::ReportingPipeline`]: asynchronous upstream reporting
//! - [`flows::FlowLifecycleManager`]: rule flow install and stale reclamation
//! - [`controller::EnforcementStatsController`]: main loop owning all state
//! - [`datapath::DatapathSupervisor`]: switch reconnection with backoff
//! - [`api`]: REST control surface for the policy application layer
//!
//! ## Collaborators
//! Traits in [`collaborators`]; shipped implementations are [`TcpDatapath`],
//! [`RedisStore`], [`HttpSessiondClient`], [`RuleIdMapper`] and [`PrefixMapper`].

pub mod aggregator;
pub mod api;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod datapath;
pub mod error;
pub mod flows;
pub mod mappers;
pub mod msg_hub;
pub mod protocol;
pub mod redis_store;
pub mod reply;
pub mod reporter;
pub mod restart;
pub mod scheduler;
pub mod sessiond;
mod tables;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::EnforcementConfig;
pub use controller::{ControllerDeps, ControllerEvent, ControllerHandle, EnforcementStatsController};
pub use datapath::{Backoff, DatapathSlot, DatapathSupervisor, TcpDatapath};
pub use error::{EnforcementStatsError, Result};
pub use flows::{DefaultFlowProvider, FlowInstaller, FlowLifecycleManager, RuleFlowRequest};
pub use mappers::{PrefixMapper, RuleIdMapper};
pub use redis_store::RedisStore;
pub use sessiond::HttpSessiondClient;
pub use tables::*;
pub use types::*;
