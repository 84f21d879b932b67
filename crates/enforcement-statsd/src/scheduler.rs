//! Drift-tolerant stats polling.
//!
//! Elapsed time is measured from the last successful report, not the last
//! poll, so a wedged reporting pipeline is detected and reset.

use crate::collaborators::Datapath;
use crate::controller::ControllerEvent;
use crate::msg_hub::MessageHub;
use crate::protocol::SwitchMessage;
use crate::tables::constants::{INIT_SLEEP_TIME, MAX_DELAY_INTERVALS, RPC_LATENCY_SLACK};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Poll,
    /// Woke up early relative to the last report.
    Skip,
    /// No report for `MAX_DELAY_INTERVALS` intervals; reference reset.
    Stalled,
}

/// What the scheduler task needs from the rest of the controller.
pub struct SchedulerContext {
    pub datapath: Arc<dyn Datapath>,
    pub hub: Arc<MessageHub>,
    pub events: mpsc::UnboundedSender<ControllerEvent>,
    pub init_finished: watch::Receiver<bool>,
    pub last_report: watch::Receiver<Instant>,
    pub tbl_num: u8,
    pub periodic: bool,
}

#[derive(Debug)]
pub struct PollScheduler {
    poll_interval: Duration,
    last_report: Instant,
    last_poll: Option<Instant>,
}

impl PollScheduler {
    pub fn new(poll_interval: Duration, now: Instant) -> Self {
        Self {
            poll_interval,
            last_report: now,
            last_poll: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    /// Takes a report completion time; never moves the reference backwards.
    pub fn observe_report(&mut self, at: Instant) {
        if at > self.last_report {
            self.last_report = at;
        }
    }

    pub fn decide(&mut self, now: Instant) -> PollDecision {
        let delta = now.saturating_duration_since(self.last_report) + RPC_LATENCY_SLACK;

        if delta > self.poll_interval * MAX_DELAY_INTERVALS {
            info!(
                last_report = %wall_clock(now, self.last_report),
                now = %wall_clock(now, now),
                "Previous usage report never completed, resetting poll reference"
            );
            self.last_report = now;
            return PollDecision::Stalled;
        }

        if delta < self.poll_interval {
            return PollDecision::Skip;
        }

        self.last_poll = Some(now);
        PollDecision::Poll
    }

    /// Runs the bootstrap phase, then polls until the controller goes away.
    pub async fn run(mut self, mut ctx: SchedulerContext) {
        while !*ctx.init_finished.borrow_and_update() {
            if ctx.events.send(ControllerEvent::BootstrapReport).is_err() {
                return;
            }
            tokio::time::sleep(INIT_SLEEP_TIME).await;
        }

        if !ctx.periodic {
            debug!("Periodic stats reporting disabled, scheduler exiting");
            return;
        }

        while !ctx.events.is_closed() {
            tokio::time::sleep(self.poll_interval).await;
            self.observe_report(*ctx.last_report.borrow());

            match self.decide(Instant::now()) {
                PollDecision::Stalled => {
                    tokio::time::sleep(self.poll_interval / 2).await;
                }
                PollDecision::Skip => {}
                PollDecision::Poll => {
                    let request = SwitchMessage::StatsRequest {
                        xid: ctx.hub.next_xid(),
                        table_id: ctx.tbl_num,
                        cookie: 0,
                        cookie_mask: 0,
                    };
                    debug!(table = ctx.tbl_num, "Polling flow stats");
                    if let Err(e) = ctx.datapath.send(request).await {
                        warn!(error = %e, "Failed to send stats request");
                    }
                }
            }
        }
    }
}

/// HH:MM:SS wall-clock rendering of a monotonic instant.
fn wall_clock(now: Instant, at: Instant) -> String {
    let wall = SystemTime::now() - now.saturating_duration_since(at);
    DateTime::<Local>::from(wall).format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDatapath;

    const INTERVAL: Duration = Duration::from_secs(10);

    #[test]
    fn test_skip_before_interval() {
        let t0 = Instant::now();
        let mut s = PollScheduler::new(INTERVAL, t0);
        assert_eq!(s.decide(t0 + Duration::from_secs(5)), PollDecision::Skip);
        assert_eq!(s.last_poll(), None);
        // slack lets a slightly early wake-up through
        assert_eq!(
            s.decide(t0 + Duration::from_millis(9_900)),
            PollDecision::Poll
        );
    }

    #[test]
    fn test_stall_resets_once() {
        let t0 = Instant::now();
        let mut s = PollScheduler::new(INTERVAL, t0);

        let stalled_at = t0 + Duration::from_secs(201);
        assert_eq!(s.decide(stalled_at), PollDecision::Stalled);

        // half an interval, then a full one
        let next = stalled_at + INTERVAL / 2 + INTERVAL;
        assert_eq!(s.decide(next), PollDecision::Poll);
        assert_eq!(s.decide(next + INTERVAL), PollDecision::Poll);
    }

    #[test]
    fn test_observe_report_is_monotonic() {
        let t0 = Instant::now();
        let mut s = PollScheduler::new(INTERVAL, t0 + Duration::from_secs(30));
        s.observe_report(t0);
        assert_eq!(
            s.decide(t0 + Duration::from_secs(35)),
            PollDecision::Skip
        );
        s.observe_report(t0 + Duration::from_secs(40));
        assert_eq!(
            s.decide(t0 + Duration::from_secs(45)),
            PollDecision::Skip
        );
    }

    fn context(
        datapath: Arc<RecordingDatapath>,
        periodic: bool,
    ) -> (
        SchedulerContext,
        mpsc::UnboundedReceiver<ControllerEvent>,
        watch::Sender<bool>,
        watch::Sender<Instant>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (init_tx, init_finished) = watch::channel(false);
        let (report_tx, last_report) = watch::channel(Instant::now());
        let ctx = SchedulerContext {
            datapath,
            hub: Arc::new(MessageHub::new(Duration::from_secs(5))),
            events,
            init_finished,
            last_report,
            tbl_num: 12,
            periodic,
        };
        (ctx, events_rx, init_tx, report_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_then_poll() {
        let datapath = Arc::new(RecordingDatapath::new(1));
        let (ctx, mut events_rx, init_tx, _report_tx) = context(datapath.clone(), true);
        tokio::spawn(PollScheduler::new(INTERVAL, Instant::now()).run(ctx));

        assert!(matches!(
            events_rx.recv().await,
            Some(ControllerEvent::BootstrapReport)
        ));
        init_tx.send(true).unwrap();

        tokio::time::sleep(INIT_SLEEP_TIME + INTERVAL + Duration::from_secs(1)).await;
        let sent = datapath.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0],
            SwitchMessage::StatsRequest { table_id: 12, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_repeats_until_init() {
        let datapath = Arc::new(RecordingDatapath::new(1));
        let (ctx, mut events_rx, _init_tx, _report_tx) = context(datapath.clone(), true);
        tokio::spawn(PollScheduler::new(INTERVAL, Instant::now()).run(ctx));

        for _ in 0..3 {
            assert!(matches!(
                events_rx.recv().await,
                Some(ControllerEvent::BootstrapReport)
            ));
        }
        assert!(datapath.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_periodic_stops_after_bootstrap() {
        let datapath = Arc::new(RecordingDatapath::new(1));
        let (ctx, _events_rx, init_tx, _report_tx) = context(datapath.clone(), false);
        init_tx.send(true).unwrap();

        let handle = tokio::spawn(PollScheduler::new(INTERVAL, Instant::now()).run(ctx));
        handle.await.unwrap();
        assert!(datapath.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_keeps_polling() {
        let datapath = Arc::new(RecordingDatapath::new(1));
        datapath.disconnect();
        let (ctx, _events_rx, init_tx, _report_tx) = context(datapath.clone(), true);
        init_tx.send(true).unwrap();

        let handle = tokio::spawn(PollScheduler::new(INTERVAL, Instant::now()).run(ctx));
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(!handle.is_finished());
    }
}
