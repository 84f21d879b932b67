//! Switch control channel over TCP.
//!
//! Newline-delimited JSON frames. A writer task drains the outbound queue; a
//! reader task routes stats replies to the controller and barrier/error
//! notifications to the message hub.
//!
//! [`DatapathSupervisor`] owns reconnection: the rest of the daemon talks to a
//! [`DatapathSlot`] that always points at the live connection, if any.

use crate::collaborators::Datapath;
use crate::controller::{ControllerEvent, EventSender};
use crate::error::{EnforcementStatsError, Result};
use crate::msg_hub::MessageHub;
use crate::protocol::{SwitchEvent, SwitchMessage};
use crate::tables::constants::HELLO_TIMEOUT;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct TcpDatapath {
    id: u64,
    outbound: mpsc::UnboundedSender<SwitchMessage>,
    closed: CancellationToken,
}

impl TcpDatapath {
    /// Connects, waits for the switch hello and starts the I/O tasks.
    #[instrument(skip(hub, events))]
    pub async fn connect(
        address: &str,
        hub: Arc<MessageHub>,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(address).await?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        let (mut sink, mut frames) = framed.split();

        let id = match tokio::time::timeout(HELLO_TIMEOUT, frames.next()).await {
            Ok(Some(Ok(line))) => match serde_json::from_str::<SwitchEvent>(&line) {
                Ok(SwitchEvent::Hello { datapath_id }) => datapath_id,
                Ok(_) => {
                    return Err(EnforcementStatsError::codec(
                        "first frame from datapath was not a hello",
                    ))
                }
                Err(e) => return Err(EnforcementStatsError::codec(e.to_string())),
            },
            Ok(Some(Err(e))) => return Err(EnforcementStatsError::transport(e.to_string())),
            Ok(None) => {
                return Err(EnforcementStatsError::transport(
                    "connection closed before hello",
                ))
            }
            Err(_) => {
                return Err(EnforcementStatsError::transport(format!(
                    "no hello within {:?}",
                    HELLO_TIMEOUT
                )))
            }
        };
        info!(datapath_id = id, address, "Connected to datapath");

        let closed = CancellationToken::new();
        let (outbound, mut queue) = mpsc::unbounded_channel::<SwitchMessage>();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    msg = queue.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let line = match serde_json::to_string(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, xid = msg.xid(), "Failed to encode datapath message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "Datapath write failed");
                    break;
                }
            }
        });

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(line) => match serde_json::from_str::<SwitchEvent>(&line) {
                        Ok(event) => dispatch_event(event, &hub, &events),
                        Err(e) => warn!(error = %e, "Undecodable datapath frame"),
                    },
                    Err(e) => {
                        warn!(error = %e, "Datapath read failed");
                        break;
                    }
                }
            }
            hub.fail_all("datapath disconnected");
            let _ = events.send(ControllerEvent::DatapathDisconnected);
            reader_closed.cancel();
        });

        Ok(Arc::new(Self {
            id,
            outbound,
            closed,
        }))
    }

    /// Resolves once the switch has closed the connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Datapath for TcpDatapath {
    fn datapath_id(&self) -> u64 {
        self.id
    }

    async fn send(&self, msg: SwitchMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| EnforcementStatsError::transport("datapath disconnected"))
    }
}

/// The current switch connection; sends fail while there is none.
#[derive(Default)]
pub struct DatapathSlot {
    current: RwLock<Option<Arc<dyn Datapath>>>,
}

impl DatapathSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, datapath: Arc<dyn Datapath>) {
        *self.current.write() = Some(datapath);
    }

    pub fn clear(&self) {
        self.current.write().take();
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().is_some()
    }

    fn current(&self) -> Option<Arc<dyn Datapath>> {
        self.current.read().clone()
    }
}

#[async_trait]
impl Datapath for DatapathSlot {
    /// 0 while disconnected.
    fn datapath_id(&self) -> u64 {
        self.current().map_or(0, |dp| dp.datapath_id())
    }

    async fn send(&self, msg: SwitchMessage) -> Result<()> {
        match self.current() {
            Some(datapath) => datapath.send(msg).await,
            None => Err(EnforcementStatsError::transport("datapath not connected")),
        }
    }
}

/// Exponential reconnect delay, doubling from `base` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.base,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Keeps a switch connection in the slot, reconnecting after every loss.
pub struct DatapathSupervisor {
    address: String,
    slot: Arc<DatapathSlot>,
    hub: Arc<MessageHub>,
    events: EventSender,
    backoff: Backoff,
}

impl DatapathSupervisor {
    pub fn new(
        address: impl Into<String>,
        slot: Arc<DatapathSlot>,
        hub: Arc<MessageHub>,
        events: EventSender,
        backoff: Backoff,
    ) -> Self {
        Self {
            address: address.into(),
            slot,
            hub,
            events,
            backoff,
        }
    }

    /// Connects, retrying with backoff, and publishes the connection.
    /// Returns `None` once the controller has gone away.
    pub async fn connect(&mut self) -> Option<Arc<TcpDatapath>> {
        loop {
            if self.events.is_closed() {
                return None;
            }
            match TcpDatapath::connect(&self.address, Arc::clone(&self.hub), self.events.clone())
                .await
            {
                Ok(datapath) => {
                    self.backoff.reset();
                    self.slot.set(datapath.clone());
                    return Some(datapath);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        address = %self.address,
                        error = %e,
                        retry_in = ?delay,
                        "Datapath connect failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Watches `current`; after a loss, reconnects and asks the controller to
    /// reinitialize the new connection.
    pub async fn run(mut self, mut current: Arc<TcpDatapath>) {
        loop {
            current.closed().await;
            self.slot.clear();
            info!(
                datapath_id = current.datapath_id(),
                address = %self.address,
                "Datapath connection lost, reconnecting"
            );

            current = match self.connect().await {
                Some(datapath) => datapath,
                None => return,
            };
            if self.events.send(ControllerEvent::DatapathConnected).is_err() {
                return;
            }
        }
    }
}

/// Routes one inbound frame. Never touches controller state directly.
pub fn dispatch_event(event: SwitchEvent, hub: &MessageHub, events: &EventSender) {
    match event {
        SwitchEvent::Hello { datapath_id } => {
            debug!(datapath_id, "Repeated hello from datapath")
        }
        SwitchEvent::StatsReply(reply) => {
            let _ = events.send(ControllerEvent::StatsReply(reply));
        }
        SwitchEvent::BarrierReply { xid } => {
            hub.handle_barrier(xid);
        }
        SwitchEvent::Error { xid, code, reason } => {
            hub.handle_error(xid, code, &reason);
        }
    }
}
