mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events that must land in the log together.
    Append {
        events: Vec<Event>,
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

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Encode the whole group and write it with a single fsync.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    let mut records = Vec::new();
    let mut count = 0u64;
    let mut waiting = Vec::with_capacity(batch.len());
    for (events, response) in batch {
        match Wal::encode(&events) {
            Ok(encoded) => {
                records.extend_from_slice(&encoded);
                count += events.len() as u64;
                waiting.push(response);
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }
    if waiting.is_empty() {
        return;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(count as f64);
    let flush_start = std::time::Instant::now();
    let result = wal.commit(&records, count);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {count} events failed: {e}");
    }
    for tx in waiting {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            commit_batch(wal, vec![(events, response)]);
        }
    }
}

/// Fleet reservation state: one lock per vehicle, one WAL for all.
pub struct Engine {
    pub state: DashMap<Ulid, SharedVehicleState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → vehicle id.
    pub(super) reservation_to_vehicle: DashMap<Ulid, Ulid>,
}

/// Reservation ids taken in the reverse index before their WAL write, so
/// two callers can never confirm the same id. Released on drop unless kept.
pub(super) struct IdClaims<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    ids: Vec<Ulid>,
}

impl<'a> IdClaims<'a> {
    pub(super) fn new(index: &'a DashMap<Ulid, Ulid>) -> Self {
        Self {
            index,
            ids: Vec::new(),
        }
    }

    /// `AlreadyExists` if `id` is stored or claimed by anyone, this batch included.
    pub(super) fn claim(&mut self, id: Ulid, vehicle_id: Ulid) -> Result<(), EngineError> {
        match self.index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(vehicle_id);
                self.ids.push(id);
                Ok(())
            }
        }
    }

    /// The claimed reservations are committed; leave the index alone.
    pub(super) fn keep(mut self) {
        self.ids.clear();
    }
}

impl Drop for IdClaims<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.index.remove(id);
        }
    }
}

/// Apply a reservation/vehicle-update event to a VehicleState.
/// Caller holds the lock.
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationConfirmed {
            id,
            vehicle_id,
            span,
            label,
        } => {
            vs.insert_reservation(Interval {
                id: *id,
                resource_id: *vehicle_id,
                span: *span,
                status: IntervalStatus::Active,
                label: label.clone(),
            });
            index.insert(*id, *vehicle_id);
        }
        Event::ReservationRescheduled { id, span, .. } => {
            if let Some(mut interval) = vs.remove_reservation(*id) {
                interval.span = *span;
                vs.insert_reservation(interval);
            }
        }
        Event::ReservationCompleted { id, .. } => {
            vs.set_status(*id, IntervalStatus::Completed);
        }
        Event::ReservationCancelled { id, .. } => {
            vs.set_status(*id, IntervalStatus::Cancelled);
        }
        Event::VehicleUpdated {
            name,
            inspection_due,
            ..
        } => {
            vs.name = name.clone();
            vs.inspection_due = *inspection_due;
        }
        // Registration and retirement are handled at the map level.
        Event::VehicleRegistered { .. } | Event::VehicleRetired { .. } => {}
    }
}

/// The vehicle an event touches, for everything except register/retire.
fn event_vehicle_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationConfirmed { vehicle_id, .. }
        | Event::ReservationRescheduled { vehicle_id, .. }
        | Event::ReservationCompleted { vehicle_id, .. }
        | Event::ReservationCancelled { vehicle_id, .. } => Some(*vehicle_id),
        Event::VehicleUpdated { id, .. } => Some(*id),
        Event::VehicleRegistered { .. } | Event::VehicleRetired { .. } => None,
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if Wal::truncate_torn_tail(&wal_path, replay.valid_len)? {
            tracing::warn!(
                "cut torn tail off {} at byte {}",
                wal_path.display(),
                replay.valid_len
            );
        }
        let events = replay.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_to_vehicle: DashMap::new(),
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events into {} vehicles from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::VehicleRegistered {
                id,
                name,
                inspection_due,
            } => {
                let vs = VehicleState::new(*id, name.clone(), *inspection_due);
                self.state.insert(*id, Arc::new(RwLock::new(vs)));
            }
            Event::VehicleRetired { id } => {
                if let Some((_, vs)) = self.state.remove(id)
                    && let Ok(guard) = vs.try_read()
                {
                    for interval in &guard.reservations {
                        self.reservation_to_vehicle.remove(&interval.id);
                    }
                }
            }
            other => {
                if let Some(vehicle_id) = event_vehicle_id(other)
                    && let Some(vs) = self.get_vehicle(&vehicle_id)
                    && let Ok(mut guard) = vs.try_write()
                {
                    apply_to_vehicle(&mut guard, other, &self.reservation_to_vehicle);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events as one unit: all of them are durable or none.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_vehicle_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_vehicle
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's write guard.
    pub(super) async fn persist_and_apply(
        &self,
        vs: &mut VehicleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_vehicle(vs, event, &self.reservation_to_vehicle);
        Ok(())
    }

    /// Lookup reservation → vehicle, then take the vehicle's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<VehicleState>), EngineError> {
        let vehicle_id = self
            .get_vehicle_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok((vehicle_id, guard))
    }
}
