//! Barrier-correlated directive delivery.
//!
//! Every flow-mod is followed by a barrier with the same xid. The switch
//! answers with either a barrier reply (applied) or an error (rejected); the
//! datapath reader resolves the matching waiter through [`MessageHub`].

use crate::collaborators::Datapath;
use crate::error::{EnforcementStatsError, Result};
use crate::protocol::{FlowMod, SwitchMessage};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Waiter = oneshot::Sender<Result<()>>;

#[derive(Debug)]
pub struct MessageHub {
    next_xid: AtomicU32,
    pending: Mutex<HashMap<u32, Waiter>>,
    timeout: Duration,
}

impl MessageHub {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_xid: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends each flow-mod followed by a barrier. The returned channel yields
    /// one result per flow-mod, in order.
    pub async fn send(
        self: &Arc<Self>,
        datapath: &dyn Datapath,
        msgs: Vec<FlowMod>,
    ) -> Result<MsgChannel> {
        let mut channel = MsgChannel::new(Arc::clone(self));
        for flow_mod in msgs {
            let xid = self.next_xid();
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(xid, tx);
            channel.waiters.push_back((xid, rx));

            // on failure the channel is dropped and forgets its waiters
            datapath
                .send(SwitchMessage::FlowMod { xid, flow_mod })
                .await?;
            datapath.send(SwitchMessage::Barrier { xid }).await?;
        }
        Ok(channel)
    }

    /// Resolves the waiter for `xid` as applied. Returns false if nobody waits.
    pub fn handle_barrier(&self, xid: u32) -> bool {
        match self.pending.lock().remove(&xid) {
            Some(waiter) => {
                let _ = waiter.send(Ok(()));
                true
            }
            None => {
                debug!(xid, "Barrier reply without waiter");
                false
            }
        }
    }

    /// Resolves the waiter for `xid` as rejected. The barrier reply that
    /// follows finds no waiter and is ignored.
    pub fn handle_error(&self, xid: u32, code: u16, reason: &str) -> bool {
        match self.pending.lock().remove(&xid) {
            Some(waiter) => {
                let _ = waiter.send(Err(EnforcementStatsError::ProtocolReject {
                    xid,
                    code,
                    reason: reason.to_string(),
                }));
                true
            }
            None => {
                warn!(xid, code, reason, "Datapath error for unknown xid");
                false
            }
        }
    }

    /// Fails every outstanding waiter; used when the connection drops.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(u32, Waiter)> = self.pending.lock().drain().collect();
        for (xid, waiter) in drained {
            debug!(xid, reason, "Failing pending directive");
            let _ = waiter.send(Err(EnforcementStatsError::transport(reason)));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn forget(&self, xid: u32) {
        self.pending.lock().remove(&xid);
    }
}

/// Results of one [`MessageHub::send`] call.
#[derive(Debug)]
pub struct MsgChannel {
    hub: Arc<MessageHub>,
    waiters: VecDeque<(u32, oneshot::Receiver<Result<()>>)>,
}

impl MsgChannel {
    fn new(hub: Arc<MessageHub>) -> Self {
        Self {
            hub,
            waiters: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Next result, or `None` once every directive has been answered.
    pub async fn get(&mut self) -> Option<Result<()>> {
        let (xid, mut rx) = self.waiters.pop_front()?;
        let result = match tokio::time::timeout(self.hub.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EnforcementStatsError::transport(format!(
                "waiter for xid {} dropped",
                xid
            ))),
            Err(_) => {
                self.hub.forget(xid);
                Err(EnforcementStatsError::ProtocolTimeout {
                    xid,
                    timeout_ms: self.hub.timeout.as_millis() as u64,
                })
            }
        };
        Some(result)
    }

    /// Waits for every directive; stops at the first failure.
    pub async fn wait_all(mut self) -> Result<()> {
        while let Some(result) = self.get().await {
            result?;
        }
        Ok(())
    }
}

impl Drop for MsgChannel {
    fn drop(&mut self) {
        for (xid, _) in self.waiters.drain(..) {
            self.hub.forget(xid);
        }
    }
}
