//! Replay engine
//!
//! One engine drives one emulated server through its history:
//!
//! ```text
//! AwaitingConnection ──client connects / barrier released──▶ Playing
//! Playing ──end of history, continuous──▶ Playing (index 0)
//! Playing ──end of history, one-shot / stop signal──▶ Stopped
//! ```
//!
//! While playing, each event sets the server's current time, is applied to
//! the bank of its slave and is followed by the gap to the next event as
//! observed in the capture. Rewind requests are polled after every event,
//! including the last one, and never cut a running sleep short; a stop
//! signal does.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{ModbusError, ModbusResult};
use crate::history::{History, HistoryEvent};
use crate::logging::describe;
use crate::register_bank::SlaveBanks;
use crate::registry::{ServerControl, ServerRegistry, StartBarrier};

/// Lifecycle of a replay engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    AwaitingConnection,
    Playing,
    Stopped,
}

/// Replays one history against one server's banks
pub struct ReplayEngine {
    id: usize,
    registry: Arc<ServerRegistry>,
    history: Arc<History>,
    banks: SlaveBanks,
    finish_delay: Duration,
    rewind_rx: mpsc::UnboundedReceiver<usize>,
    stop_rx: broadcast::Receiver<()>,
    connections: watch::Receiver<usize>,
    barrier: Option<StartBarrier>,
    close_tx: Option<oneshot::Sender<()>>,
    state: ReplayState,
}

impl ReplayEngine {
    /// Engine for the registered server `control.id`
    ///
    /// `connections` counts client connections accepted by the server's
    /// listener; playback starts once it is non-zero.
    pub fn new(
        registry: Arc<ServerRegistry>,
        control: ServerControl,
        connections: watch::Receiver<usize>,
        finish_delay: Duration,
    ) -> ModbusResult<Self> {
        let history = registry.history(control.id)?;
        let banks = registry.slave_banks(control.id)?;
        Ok(Self {
            id: control.id,
            registry,
            history,
            banks,
            finish_delay,
            rewind_rx: control.rewind,
            stop_rx: control.stop,
            connections,
            barrier: None,
            close_tx: None,
            state: ReplayState::AwaitingConnection,
        })
    }

    /// Join a simultaneous-start cohort
    pub fn with_barrier(mut self, barrier: StartBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Receiver fired when a one-shot replay reaches the end of its history
    ///
    /// The sender is dropped without firing when the engine is stopped
    /// externally.
    pub fn close_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.close_tx = Some(tx);
        rx
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Run until the history ends in one-shot mode or a stop is signalled
    pub async fn run(mut self) -> ModbusResult<()> {
        if self.history.is_empty() {
            return Err(ModbusError::server(self.id, "history is empty"));
        }
        if !self.history.events().iter().any(|event| event.handshake.is_valid()) {
            return Err(ModbusError::server(self.id, "history has no replayable events"));
        }

        info!("⏳ Server {} awaiting connection", self.id);
        if !self.await_start().await {
            return self.finish(false);
        }

        self.state = ReplayState::Playing;
        self.registry.set_working(self.id, true)?;
        info!("▶️ Server {} playing {} events", self.id, self.history.len());

        let len = self.history.len();
        let mut index = 0usize;
        loop {
            let history = Arc::clone(&self.history);
            let Some(event) = history.get(index) else {
                return Err(ModbusError::internal(format!("history index {} out of range", index)));
            };
            let delay = match history.get(index + 1) {
                Some(next) => (next.observed_time - event.observed_time)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                None => self.finish_delay,
            };

            self.registry.set_current_time(self.id, event.observed_time)?;

            let stopped = if self.apply(index, event) {
                self.sleep(delay).await
            } else {
                self.skip().await
            };
            if stopped {
                return self.finish(false);
            }

            index += 1;
            if let Some(target) = self.pending_rewind() {
                info!("⏪ Server {} rewinding from event {} to event {}", self.id, index, target);
                index = target;
            } else if index == len {
                if self.registry.is_one_shot(self.id)? {
                    info!("🏁 Server {} reached the end of its history, stopping", self.id);
                    return self.finish(true);
                }
                info!("🔁 Server {} reached the end of its history, looping", self.id);
                index = 0;
            }
        }
    }

    /// Wait for a client connection or a cohort release; false when stopped first
    async fn await_start(&mut self) -> bool {
        let id = self.id;
        let barrier = self.barrier.clone();
        let stop_rx = &mut self.stop_rx;
        let connections = &mut self.connections;
        let connected = async move {
            if connections.wait_for(|count| *count > 0).await.is_err() {
                // listener gone without a client; only a stop can end the wait
                std::future::pending::<()>().await;
            }
        };

        match barrier {
            Some(barrier) => {
                tokio::select! {
                    _ = connected => {
                        if barrier.release() {
                            info!("📣 Server {} released the simultaneous start", id);
                        }
                        true
                    }
                    _ = barrier.wait() => {
                        debug!("Server {} released by cohort", id);
                        true
                    }
                    _ = stop_rx.recv() => false,
                }
            }
            None => {
                tokio::select! {
                    _ = connected => true,
                    _ = stop_rx.recv() => false,
                }
            }
        }
    }

    /// Latest valid rewind target, draining older ones
    fn pending_rewind(&mut self) -> Option<usize> {
        let mut target = None;
        while let Ok(index) = self.rewind_rx.try_recv() {
            if index < self.history.len() {
                target = Some(index);
            } else {
                warn!("⚠️ Server {} ignoring rewind to {}: history has {} events",
                      self.id, index, self.history.len());
            }
        }
        target
    }

    /// Apply one event; false when it was skipped as invalid
    fn apply(&self, index: usize, event: &HistoryEvent) -> bool {
        if !event.handshake.is_valid() {
            warn!("⚠️ Server {} skipping event {}: response function 0x{:02X} is not supported",
                  self.id, index, event.handshake.function_id());
            return false;
        }

        let result = event
            .handshake
            .emulation_data()
            .and_then(|data| {
                let bank = self.banks.get(event.slave_id).ok_or_else(|| {
                    ModbusError::server(self.id, format!("no bank for slave {}", event.slave_id))
                })?;
                debug!(
                    "Server {} event {} slave {}: {}",
                    self.id,
                    index,
                    event.slave_id,
                    describe(&data)
                );
                bank.apply(&data)
            });

        match result {
            Ok(_) => {}
            Err(e) if e.is_decode_error() => {
                warn!("⚠️ Server {} event {} not applied: {}", self.id, index, e);
            }
            Err(e) => error!("❌ Server {} event {} failed: {}", self.id, index, e),
        }
        true
    }

    /// Sleep for `delay`; true when interrupted by a stop signal
    async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.stop_rx.recv() => true,
        }
    }

    /// Yield after a skipped event; true when a stop is already pending
    async fn skip(&mut self) -> bool {
        if !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            return true;
        }
        tokio::task::yield_now().await;
        false
    }

    fn finish(mut self, completed: bool) -> ModbusResult<()> {
        self.state = ReplayState::Stopped;
        self.registry.set_working(self.id, false)?;
        if completed {
            if let Some(close) = self.close_tx.take() {
                let _ = close.send(());
            }
        } else {
            info!("⏹️ Server {} stopped", self.id);
        }
        Ok(())
    }
}
