use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::debug;

use crate::model::*;
use crate::wal::Wal;

use super::{BookingStore, SlotSnapshot, StoreError};

pub type SharedSlot = Arc<RwLock<SlotState>>;

/// Bookings for one machine/date.
#[derive(Debug, Default)]
pub struct SlotState {
    /// Count of successful appends. Deletes leave it alone: a snapshot that
    /// missed a delete can only over-report conflicts.
    pub version: u64,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    fn remove(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Takes the first queued append, drains whatever else is
/// already queued, fsyncs once for the whole batch, then answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Single-node booking store: machines and per-slot booking sets in memory,
/// every mutation journaled to the WAL before it becomes visible.
///
/// Mutations run on their own task. A caller that stops waiting (a timeout,
/// a dropped connection) cannot stop a write between the WAL and memory.
pub struct LocalStore {
    state: Arc<StoreState>,
}

struct StoreState {
    machines: DashMap<MachineId, Machine>,
    slots: DashMap<SlotKey, SharedSlot>,
    /// Reverse lookup: booking id → slot.
    booking_to_slot: DashMap<BookingId, SlotKey>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared. Compaction and machine retirement hold it
    /// exclusive, so no append is in flight across them.
    exclusive: RwLock<()>,
}

impl LocalStore {
    /// Replay the WAL at `path` and start its writer task. Must run inside a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state = StoreState {
            machines: DashMap::new(),
            slots: DashMap::new(),
            booking_to_slot: DashMap::new(),
            wal_tx,
            exclusive: RwLock::new(()),
        };
        let replayed = events.len();
        for event in events {
            state.replay_event(event);
        }
        debug!("replayed {replayed} events from {}", path.display());
        Ok(Self {
            state: Arc::new(state),
        })
    }

    /// Run a mutation to completion on its own task and wait for the outcome.
    async fn detached<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<StoreState>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.state.clone()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        self.detached(move |state| async move { state.compact().await }).await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .state
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl StoreState {
    /// Apply a replayed event. We are the only owner of every slot lock here,
    /// so `try_write` never contends.
    fn replay_event(&self, event: Event) {
        match event {
            Event::MachineAdded { id, name, capacity, access_group } => {
                self.machines
                    .insert(id, Machine::new(id, name, capacity, access_group));
            }
            Event::MachineUpdated { id, name, capacity, access_group } => {
                let mut entry = self
                    .machines
                    .entry(id)
                    .or_insert_with(|| Machine::new(id, String::new(), String::new(), None));
                entry.name = name;
                entry.capacity = capacity;
                entry.access_group = access_group;
            }
            Event::MachineRetired { id } => {
                if let Some(mut machine) = self.machines.get_mut(&id) {
                    machine.retired = true;
                }
            }
            confirmed @ Event::BookingConfirmed { .. } => {
                let Some(booking) = confirmed.into_booking() else {
                    return;
                };
                let key = booking.slot();
                let slot = self.slots.entry(key).or_default().value().clone();
                let Ok(mut guard) = slot.try_write() else {
                    return;
                };
                self.booking_to_slot.insert(booking.id, key);
                guard.insert(booking);
                guard.version += 1;
            }
            Event::BookingCancelled { id, machine_id, date } => {
                let key = SlotKey::new(machine_id, date);
                if let Some(slot) = self.slots.get(&key).map(|e| e.value().clone())
                    && let Ok(mut guard) = slot.try_write()
                {
                    guard.remove(id);
                }
                self.booking_to_slot.remove(&id);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL write failed: {e}")))
    }

    fn slot(&self, key: &SlotKey) -> Option<SharedSlot> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    fn all_slots(&self) -> Vec<SharedSlot> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.exclusive.write().await;
        let mut machines: Vec<Machine> = self.machines.iter().map(|e| e.value().clone()).collect();
        machines.sort_by_key(|m| m.id);

        let mut events = Vec::with_capacity(machines.len());
        for machine in machines {
            let id = machine.id;
            let retired = machine.retired;
            events.push(Event::MachineAdded {
                id,
                name: machine.name,
                capacity: machine.capacity,
                access_group: machine.access_group,
            });
            if retired {
                events.push(Event::MachineRetired { id });
            }
        }
        for slot in self.all_slots() {
            let guard = slot.read().await;
            events.extend(guard.bookings.iter().map(Event::confirmed));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))
    }

    async fn put_machine(&self, machine: Machine) -> Result<(), StoreError> {
        let _shared = self.exclusive.read().await;
        let event = if self.machines.contains_key(&machine.id) {
            Event::MachineUpdated {
                id: machine.id,
                name: machine.name.clone(),
                capacity: machine.capacity.clone(),
                access_group: machine.access_group.clone(),
            }
        } else {
            Event::MachineAdded {
                id: machine.id,
                name: machine.name.clone(),
                capacity: machine.capacity.clone(),
                access_group: machine.access_group.clone(),
            }
        };
        self.wal_append(&event).await?;

        let mut entry = self
            .machines
            .entry(machine.id)
            .or_insert_with(|| machine.clone());
        entry.name = machine.name;
        entry.capacity = machine.capacity;
        entry.access_group = machine.access_group;
        Ok(())
    }

    async fn retire_machine(&self, id: MachineId) -> Result<bool, StoreError> {
        let _exclusive = self.exclusive.write().await;
        match self.machines.get(&id).map(|m| m.retired) {
            None => return Ok(false),
            Some(true) => return Ok(true),
            Some(false) => {}
        }
        self.wal_append(&Event::MachineRetired { id }).await?;
        if let Some(mut machine) = self.machines.get_mut(&id) {
            machine.retired = true;
        }
        Ok(true)
    }

    async fn append_booking(
        &self,
        booking: Booking,
        expected_version: u64,
    ) -> Result<BookingId, StoreError> {
        let key = booking.slot();
        let _shared = self.exclusive.read().await;
        // Retirement holds the exclusive lock, so this stays true until we are done.
        if !self
            .machines
            .get(&booking.machine_id)
            .is_some_and(|m| !m.retired)
        {
            return Err(StoreError::UnknownMachine(booking.machine_id));
        }
        let slot = self.slots.entry(key).or_default().value().clone();
        let mut guard = slot.write().await;
        if guard.version != expected_version {
            return Err(StoreError::VersionMismatch {
                expected: expected_version,
                actual: guard.version,
            });
        }

        self.wal_append(&Event::confirmed(&booking)).await?;
        let id = booking.id;
        self.booking_to_slot.insert(id, key);
        guard.insert(booking);
        guard.version += 1;
        Ok(id)
    }

    async fn delete_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let Some(key) = self.booking_to_slot.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(slot) = self.slot(&key) else {
            return Ok(None);
        };
        let _shared = self.exclusive.read().await;
        let mut guard = slot.write().await;
        let Some(booking) = guard.bookings.iter().find(|b| b.id == id).cloned() else {
            return Ok(None);
        };

        self.wal_append(&Event::cancelled(&booking)).await?;
        guard.remove(id);
        self.booking_to_slot.remove(&id);
        Ok(Some(booking))
    }
}

#[async_trait]
impl BookingStore for LocalStore {
    async fn find_machine(&self, id: MachineId) -> Result<Option<Machine>, StoreError> {
        Ok(self.state.machines.get(&id).map(|m| m.value().clone()))
    }

    async fn list_machines(&self, access_group: Option<&str>) -> Result<Vec<Machine>, StoreError> {
        let mut machines: Vec<Machine> = self
            .state
            .machines
            .iter()
            .filter(|m| !m.retired && access_group.is_none_or(|g| m.visible_to(Some(g))))
            .map(|m| m.value().clone())
            .collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(machines)
    }

    async fn put_machine(&self, machine: Machine) -> Result<(), StoreError> {
        self.detached(move |state| async move { state.put_machine(machine).await })
            .await
    }

    async fn retire_machine(&self, id: MachineId) -> Result<bool, StoreError> {
        self.detached(move |state| async move { state.retire_machine(id).await })
            .await
    }

    async fn list_bookings(&self, key: SlotKey) -> Result<SlotSnapshot, StoreError> {
        let Some(slot) = self.state.slot(&key) else {
            return Ok(SlotSnapshot::default());
        };
        let guard = slot.read().await;
        Ok(SlotSnapshot {
            bookings: guard.bookings.clone(),
            version: guard.version,
        })
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let Some(key) = self.state.booking_to_slot.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(slot) = self.state.slot(&key) else {
            return Ok(None);
        };
        let guard = slot.read().await;
        Ok(guard.bookings.iter().find(|b| b.id == id).cloned())
    }

    async fn append_booking(
        &self,
        booking: Booking,
        expected_version: u64,
    ) -> Result<BookingId, StoreError> {
        self.detached(move |state| async move {
            state.append_booking(booking, expected_version).await
        })
        .await
    }

    async fn delete_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        self.detached(move |state| async move { state.delete_booking(id).await })
            .await
    }

    async fn bookings_for_requester(&self, user_id: &str) -> Result<Vec<Booking>, StoreError> {
        let mut found = Vec::new();
        for slot in self.state.all_slots() {
            let guard = slot.read().await;
            found.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.requester.user_id == user_id)
                    .cloned(),
            );
        }
        found.sort_by_key(|b| (b.date, b.span.start));
        Ok(found)
    }
}
