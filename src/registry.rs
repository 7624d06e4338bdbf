//! Server registry and start coordination
//!
//! [`ServerRegistry`] is created once per process and shared by every
//! emulated server. Each server occupies one append-only slot whose index is
//! its id for the lifetime of the process. All slots sit behind a single
//! `RwLock`; it is taken only for the duration of a field access and never
//! across an await.
//!
//! [`StartBarrier`] implements simultaneous emulation: the first server whose
//! client connects releases every other pending server at once.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::{ModbusError, ModbusResult};
use crate::history::History;
use crate::protocol::WireMode;
use crate::register_bank::SlaveBanks;

/// Identity and live state of one emulated server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDescriptor {
    pub id: usize,
    /// Socket the emulator listens on
    pub emulate: SocketAddr,
    /// Device socket as recorded in the capture
    pub dump: SocketAddr,
    pub protocol: WireMode,
    pub one_shot: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub history_len: usize,
    /// Observed time of the event being played
    pub current_time: Option<DateTime<Utc>>,
    pub working: bool,
}

impl ServerDescriptor {
    /// Descriptor for a server that has not started playing yet
    ///
    /// The id is assigned by [`ServerRegistry::register`].
    pub fn new(
        emulate: SocketAddr,
        dump: SocketAddr,
        protocol: WireMode,
        one_shot: bool,
        history: &History,
    ) -> Self {
        Self {
            id: 0,
            emulate,
            dump,
            protocol,
            one_shot,
            start_time: history.start_time(),
            end_time: history.end_time(),
            history_len: history.len(),
            current_time: None,
            working: false,
        }
    }
}

/// Channel ends handed to the replay engine of a freshly registered server
#[derive(Debug)]
pub struct ServerControl {
    pub id: usize,
    pub rewind: mpsc::UnboundedReceiver<usize>,
    pub stop: broadcast::Receiver<()>,
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    history: Arc<History>,
    banks: SlaveBanks,
    rewind_tx: mpsc::UnboundedSender<usize>,
    stop_tx: broadcast::Sender<()>,
}

/// All servers of the process
#[derive(Default)]
pub struct ServerRegistry {
    slots: RwLock<Vec<ServerSlot>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ModbusResult<RwLockReadGuard<'_, Vec<ServerSlot>>> {
        self.slots
            .read()
            .map_err(|_| ModbusError::internal("Failed to lock server registry"))
    }

    fn write(&self) -> ModbusResult<RwLockWriteGuard<'_, Vec<ServerSlot>>> {
        self.slots
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock server registry"))
    }

    fn with_slot<T>(
        &self,
        id: usize,
        f: impl FnOnce(&ServerSlot) -> ModbusResult<T>,
    ) -> ModbusResult<T> {
        let slots = self.read()?;
        let slot = slots.get(id).ok_or_else(|| ModbusError::server(id, "no such server"))?;
        f(slot)
    }

    fn with_slot_mut<T>(&self, id: usize, f: impl FnOnce(&mut ServerSlot) -> T) -> ModbusResult<T> {
        let mut slots = self.write()?;
        let slot = slots.get_mut(id).ok_or_else(|| ModbusError::server(id, "no such server"))?;
        Ok(f(slot))
    }

    /// Append a server and return the channel ends its replay engine consumes
    pub fn register(
        &self,
        mut descriptor: ServerDescriptor,
        history: Arc<History>,
        banks: SlaveBanks,
    ) -> ModbusResult<ServerControl> {
        let (rewind_tx, rewind) = mpsc::unbounded_channel();
        let (stop_tx, stop) = broadcast::channel(1);

        let mut slots = self.write()?;
        let id = slots.len();
        descriptor.id = id;
        info!("📝 Registered server {} ({} emulating {}, {} events)",
              id, descriptor.emulate, descriptor.dump, descriptor.history_len);
        slots.push(ServerSlot { descriptor, history, banks, rewind_tx, stop_tx });

        Ok(ServerControl { id, rewind, stop })
    }

    pub fn len(&self) -> usize {
        self.read().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every descriptor, in id order
    pub fn descriptors(&self) -> ModbusResult<Vec<ServerDescriptor>> {
        Ok(self.read()?.iter().map(|slot| slot.descriptor.clone()).collect())
    }

    pub fn descriptor(&self, id: usize) -> ModbusResult<ServerDescriptor> {
        self.with_slot(id, |slot| Ok(slot.descriptor.clone()))
    }

    pub fn history(&self, id: usize) -> ModbusResult<Arc<History>> {
        self.with_slot(id, |slot| Ok(Arc::clone(&slot.history)))
    }

    /// Banks a server exposes; clones share storage with the server
    pub fn slave_banks(&self, id: usize) -> ModbusResult<SlaveBanks> {
        self.with_slot(id, |slot| Ok(slot.banks.clone()))
    }

    /// Fresh receiver on a server's stop channel
    pub fn subscribe_stop(&self, id: usize) -> ModbusResult<broadcast::Receiver<()>> {
        self.with_slot(id, |slot| Ok(slot.stop_tx.subscribe()))
    }

    pub fn set_current_time(&self, id: usize, time: DateTime<Utc>) -> ModbusResult<()> {
        self.with_slot_mut(id, |slot| slot.descriptor.current_time = Some(time))
    }

    pub fn set_working(&self, id: usize, working: bool) -> ModbusResult<()> {
        self.with_slot_mut(id, |slot| slot.descriptor.working = working)
    }

    pub fn is_one_shot(&self, id: usize) -> ModbusResult<bool> {
        self.with_slot(id, |slot| Ok(slot.descriptor.one_shot))
    }

    /// Switch one server, or all of them, between one-shot and continuous
    ///
    /// Takes effect at the server's next end of history.
    pub fn set_one_shot(&self, id: Option<usize>, one_shot: bool) -> ModbusResult<()> {
        match id {
            Some(id) => self.with_slot_mut(id, |slot| slot.descriptor.one_shot = one_shot),
            None => {
                for slot in self.write()?.iter_mut() {
                    slot.descriptor.one_shot = one_shot;
                }
                Ok(())
            }
        }?;
        info!("🔁 Emulation mode of {} set to {}",
              id.map_or("all servers".to_string(), |id| format!("server {}", id)),
              if one_shot { "one-shot" } else { "continuous" });
        Ok(())
    }

    /// Ask a playing server to continue from history index `index`
    ///
    /// Never blocks; the server picks the request up before its next event.
    pub fn rewind(&self, id: usize, index: usize) -> ModbusResult<()> {
        self.with_slot(id, |slot| {
            if !slot.descriptor.working {
                return Err(ModbusError::server(id, "server is not working"));
            }
            if index >= slot.descriptor.history_len {
                return Err(ModbusError::server(id, format!(
                    "rewind index {} outside history of {} events",
                    index, slot.descriptor.history_len
                )));
            }
            slot.rewind_tx
                .send(index)
                .map_err(|_| ModbusError::server(id, "replay engine has exited"))?;
            debug!("Rewind of server {} to index {} queued", id, index);
            Ok(())
        })
    }

    /// Rewind to the last event observed strictly before `timepoint`
    ///
    /// The timepoint must lie strictly between the history's start and end
    /// times, and the server must be playing.
    pub fn rewind_to_time(&self, id: usize, timepoint: DateTime<Utc>) -> ModbusResult<usize> {
        let index = self.with_slot(id, |slot| {
            let descriptor = &slot.descriptor;
            if !descriptor.working || descriptor.current_time.is_none() {
                return Err(ModbusError::server(id, "server is not playing"));
            }
            let in_range = matches!(
                (descriptor.start_time, descriptor.end_time),
                (Some(start), Some(end)) if start < timepoint && timepoint < end
            );
            if !in_range {
                return Err(ModbusError::server(id, format!(
                    "timepoint {} outside the history", timepoint
                )));
            }
            slot.history
                .index_before(timepoint)
                .ok_or_else(|| ModbusError::server(id, format!("no event before {}", timepoint)))
        })?;

        self.rewind(id, index)?;
        Ok(index)
    }

    /// Signal a server's stop channel
    pub fn stop(&self, id: usize) -> ModbusResult<()> {
        self.with_slot_mut(id, |slot| {
            slot.descriptor.working = false;
            // no receivers left means the server already finished
            let _ = slot.stop_tx.send(());
        })?;
        info!("⏹️ Stop requested for server {}", id);
        Ok(())
    }

    /// Signal every server's stop channel
    pub fn stop_all(&self) -> ModbusResult<()> {
        for id in 0..self.len() {
            self.stop(id)?;
        }
        Ok(())
    }
}

/// One-shot latch releasing every waiting server at the same instant
#[derive(Debug, Clone)]
pub struct StartBarrier {
    released: Arc<watch::Sender<bool>>,
}

impl StartBarrier {
    pub fn new() -> Self {
        let (released, _) = watch::channel(false);
        Self { released: Arc::new(released) }
    }

    /// Release all waiters; returns false when already released
    pub fn release(&self) -> bool {
        self.released.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        })
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Resolve once [`release`](Self::release) has been called
    pub async fn wait(&self) {
        let mut receiver = self.released.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = receiver.wait_for(|released| *released).await;
    }
}

impl Default for StartBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VecSource;
    use crate::history::correlate;
    use chrono::{Duration, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn three_event_history() -> History {
        let mut source = VecSource::new();
        for (i, ms) in [100i64, 200, 300].into_iter().enumerate() {
            let tid = i as u8 + 1;
            source = source
                .request(t(0), vec![0, tid, 0, 0, 0, 6, 1, 6, 0, 0, 0, tid])
                .response(t(ms), vec![0, tid, 0, 0, 0, 6, 1, 6, 0, 0, 0, tid]);
        }
        correlate(&source, WireMode::Tcp).unwrap()
    }

    fn register(registry: &ServerRegistry, port: u16) -> ServerControl {
        let history = three_event_history();
        let descriptor = ServerDescriptor::new(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            "10.0.0.5:502".parse().unwrap(),
            WireMode::Tcp,
            false,
            &history,
        );
        let banks = SlaveBanks::for_slaves(&history.slaves());
        registry.register(descriptor, Arc::new(history), banks).unwrap()
    }

    #[test]
    fn test_slots_are_append_only() {
        let registry = ServerRegistry::new();
        assert_eq!(register(&registry, 5020).id, 0);
        assert_eq!(register(&registry, 5021).id, 1);
        registry.stop(0).unwrap();
        assert_eq!(register(&registry, 5022).id, 2);

        let descriptors = registry.descriptors().unwrap();
        let ids: Vec<usize> = descriptors.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(descriptors[1].emulate.port(), 5021);
        assert_eq!(descriptors[1].start_time, Some(t(100)));
        assert_eq!(descriptors[1].end_time, Some(t(300)));
        assert!(registry.descriptor(3).is_err());
    }

    #[test]
    fn test_rewind_validation() {
        let registry = ServerRegistry::new();
        let mut control = register(&registry, 5020);

        // not working yet
        assert!(registry.rewind(0, 1).is_err());

        registry.set_working(0, true).unwrap();
        assert!(registry.rewind(0, 3).is_err());
        registry.rewind(0, 2).unwrap();
        assert_eq!(control.rewind.try_recv().unwrap(), 2);
        assert!(registry.rewind(1, 0).is_err());
    }

    #[test]
    fn test_rewind_to_time() {
        let registry = ServerRegistry::new();
        let mut control = register(&registry, 5020);
        registry.set_working(0, true).unwrap();

        // working but no event played yet
        assert!(registry.rewind_to_time(0, t(250)).is_err());

        registry.set_current_time(0, t(100)).unwrap();
        assert_eq!(registry.rewind_to_time(0, t(250)).unwrap(), 1);
        assert_eq!(control.rewind.try_recv().unwrap(), 1);

        // bounds are exclusive
        assert!(registry.rewind_to_time(0, t(100)).is_err());
        assert!(registry.rewind_to_time(0, t(300)).is_err());
        assert!(registry.rewind_to_time(0, t(50)).is_err());
    }

    #[test]
    fn test_set_one_shot() {
        let registry = ServerRegistry::new();
        register(&registry, 5020);
        register(&registry, 5021);

        registry.set_one_shot(Some(1), true).unwrap();
        assert!(!registry.is_one_shot(0).unwrap());
        assert!(registry.is_one_shot(1).unwrap());

        registry.set_one_shot(None, true).unwrap();
        assert!(registry.descriptors().unwrap().iter().all(|d| d.one_shot));
        assert!(registry.set_one_shot(Some(7), false).is_err());
    }

    #[test]
    fn test_stop_signals_server() {
        let registry = ServerRegistry::new();
        let mut control = register(&registry, 5020);
        registry.set_working(0, true).unwrap();

        registry.stop(0).unwrap();
        assert!(control.stop.try_recv().is_ok());
        assert!(!registry.descriptor(0).unwrap().working);
    }

    #[test]
    fn test_slave_banks_are_shared() {
        let registry = ServerRegistry::new();
        register(&registry, 5020);
        let banks = registry.slave_banks(0).unwrap();
        banks.get(1).unwrap().write_register(4, 9).unwrap();

        let again = registry.slave_banks(0).unwrap();
        assert_eq!(again.get(1).unwrap().read_holding_registers(4, 1).unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_start_barrier_releases_all_waiters() {
        let barrier = StartBarrier::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                tokio::spawn(async move { barrier.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        assert!(!barrier.is_released());
        assert!(barrier.release());
        assert!(!barrier.release());

        for waiter in waiters {
            tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }

        // late waiters pass straight through
        tokio::time::timeout(std::time::Duration::from_millis(100), barrier.wait())
            .await
            .unwrap();
    }
}
