use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{ensure_available, validate_instant, validate_label, validate_span};
use super::{Engine, EngineError, IdClaims, WalCommand, apply_to_vehicle, event_vehicle_id};

fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("vehicle name too long"));
    }
    Ok(())
}

fn validate_inspection_due(due: Option<Ms>) -> Result<(), EngineError> {
    due.map_or(Ok(()), validate_instant)
}

impl Engine {
    pub async fn register_vehicle(
        &self,
        id: Ulid,
        name: Option<String>,
        inspection_due: Option<Ms>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        validate_name(name.as_deref())?;
        validate_inspection_due(inspection_due)?;

        // Locked before it becomes visible, so nothing lands in the WAL for
        // this vehicle ahead of its registration.
        let vs = Arc::new(RwLock::new(VehicleState::new(id, name.clone(), inspection_due)));
        let mut guard = vs.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(vs.clone());
            }
        }

        let event = Event::VehicleRegistered {
            id,
            name,
            inspection_due,
        };
        if let Err(e) = self.wal_append(&event).await {
            guard.retired = true;
            self.state.remove_if(&id, |_, current| Arc::ptr_eq(current, &vs));
            return Err(e);
        }
        info!("registered vehicle {id}");
        Ok(())
    }

    /// Change the named columns of a vehicle. The merge happens under the
    /// write guard so concurrent patches of different columns both stick.
    pub async fn update_vehicle(&self, id: Ulid, patch: VehiclePatch) -> Result<(), EngineError> {
        validate_name(patch.name.as_ref().and_then(|n| n.as_deref()))?;
        if let Some(due) = patch.inspection_due {
            validate_inspection_due(due)?;
        }
        let vs = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = vs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::VehicleUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            inspection_due: patch.inspection_due.unwrap_or(guard.inspection_due),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a vehicle from the fleet. Refused while it still has active
    /// reservations; its history goes with it.
    pub async fn retire_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let vs = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = vs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        let count = guard.active_count();
        if count > 0 {
            return Err(EngineError::HasActiveReservations { id, count });
        }

        let event = Event::VehicleRetired { id };
        self.wal_append(&event).await?;
        // Still under the guard: waiters see `retired` once they get in.
        guard.retired = true;
        for interval in &guard.reservations {
            self.reservation_to_vehicle.remove(&interval.id);
        }
        self.state.remove_if(&id, |_, current| Arc::ptr_eq(current, &vs));
        drop(guard);
        info!("retired vehicle {id}");
        Ok(())
    }

    /// Check and persist under the same write guard, so two concurrent
    /// confirmations on one vehicle cannot both succeed.
    pub async fn confirm_reservation(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        span: Span,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_label(label.as_deref())?;
        let mut claims = IdClaims::new(&self.reservation_to_vehicle);
        claims.claim(id, vehicle_id)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let mut guard = vs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(vehicle_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
        }

        ensure_available(&guard, id, &span, None)?;

        let event = Event::ReservationConfirmed {
            id,
            vehicle_id,
            span,
            label,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claims.keep();
        info!("confirmed reservation {id} on vehicle {vehicle_id} {span}");
        Ok(())
    }

    /// Confirm several reservations atomically. All-or-nothing: if any one
    /// conflicts with stored reservations or with another in the batch,
    /// none are committed. Reservations may target different vehicles.
    pub async fn batch_confirm_reservations(
        &self,
        reservations: Vec<NewReservation>,
    ) -> Result<(), EngineError> {
        if reservations.is_empty() {
            return Ok(());
        }
        if reservations.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut claims = IdClaims::new(&self.reservation_to_vehicle);
        for r in &reservations {
            validate_span(&r.span)?;
            validate_label(r.label.as_deref())?;
            claims.claim(r.id, r.vehicle_id)?;
        }

        // Sorted lock order prevents deadlocks between overlapping batches.
        let mut vehicle_ids: Vec<Ulid> = reservations.iter().map(|r| r.vehicle_id).collect();
        vehicle_ids.sort();
        vehicle_ids.dedup();

        let mut guards = Vec::with_capacity(vehicle_ids.len());
        let mut guard_index = HashMap::new();
        for vid in &vehicle_ids {
            let vs = self.get_vehicle(vid).ok_or(EngineError::NotFound(*vid))?;
            let guard = vs.write_owned().await;
            if guard.retired {
                return Err(EngineError::NotFound(*vid));
            }
            if guard.reservations.len() + reservations.len() > MAX_RESERVATIONS_PER_VEHICLE {
                return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
            }
            guard_index.insert(*vid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate against stored state and within the batch.
        let mut by_vehicle: HashMap<Ulid, Vec<&NewReservation>> = HashMap::new();
        for r in &reservations {
            by_vehicle.entry(r.vehicle_id).or_default().push(r);
        }
        for (vid, batch) in &by_vehicle {
            let guard = &guards[guard_index[vid]];
            for r in batch {
                ensure_available(guard, r.id, &r.span, None)?;
            }
            for (i, a) in batch.iter().enumerate() {
                let clashing: Vec<Ulid> = batch[i + 1..]
                    .iter()
                    .filter(|b| a.span.overlaps(&b.span))
                    .map(|b| b.id)
                    .collect();
                if !clashing.is_empty() {
                    return Err(EngineError::Conflict {
                        id: a.id,
                        conflicts: clashing,
                    });
                }
            }
        }

        // Phase 2: one WAL write for the whole batch, then apply in memory.
        let events: Vec<Event> = reservations
            .into_iter()
            .map(|r| Event::ReservationConfirmed {
                id: r.id,
                vehicle_id: r.vehicle_id,
                span: r.span,
                label: r.label,
            })
            .collect();
        let count = events.len();
        self.wal_append_all(events.clone()).await?;
        for event in &events {
            if let Some(vid) = event_vehicle_id(event) {
                let guard = &mut guards[guard_index[&vid]];
                apply_to_vehicle(guard, event, &self.reservation_to_vehicle);
            }
        }
        claims.keep();
        info!("confirmed batch of {count} reservations");
        Ok(())
    }

    /// Move an active reservation to a new span. The reservation's own
    /// current span is excluded from the conflict check.
    pub async fn reschedule_reservation(&self, id: Ulid, span: Span) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(id)
            .map(|i| i.status)
            .ok_or(EngineError::NotFound(id))?;
        if status.is_terminal() {
            return Err(EngineError::InvalidTransition { id, status });
        }

        ensure_available(&guard, id, &span, Some(id))?;

        let event = Event::ReservationRescheduled {
            id,
            vehicle_id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("rescheduled reservation {id} to {span}");
        Ok(vehicle_id)
    }

    pub async fn complete_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.finish_reservation(id, IntervalStatus::Completed).await
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.finish_reservation(id, IntervalStatus::Cancelled).await
    }

    /// Apply a lifecycle transition. Terminal states are final.
    pub async fn transition_reservation(
        &self,
        id: Ulid,
        to: IntervalStatus,
    ) -> Result<Ulid, EngineError> {
        match to {
            IntervalStatus::Completed | IntervalStatus::Cancelled => {
                self.finish_reservation(id, to).await
            }
            // Reopening would break append-only history.
            IntervalStatus::Active => {
                let vehicle_id = self
                    .get_vehicle_for_reservation(&id)
                    .ok_or(EngineError::NotFound(id))?;
                let vs = self
                    .get_vehicle(&vehicle_id)
                    .ok_or(EngineError::NotFound(vehicle_id))?;
                let guard = vs.read().await;
                let status = guard
                    .reservation(id)
                    .map(|i| i.status)
                    .ok_or(EngineError::NotFound(id))?;
                if status.is_terminal() {
                    Err(EngineError::InvalidTransition { id, status })
                } else {
                    Ok(vehicle_id)
                }
            }
        }
    }

    async fn finish_reservation(&self, id: Ulid, to: IntervalStatus) -> Result<Ulid, EngineError> {
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let status = guard
            .reservation(id)
            .map(|i| i.status)
            .ok_or(EngineError::NotFound(id))?;
        if status.is_terminal() {
            return Err(EngineError::InvalidTransition { id, status });
        }

        let event = match to {
            IntervalStatus::Completed => Event::ReservationCompleted { id, vehicle_id },
            _ => Event::ReservationCancelled { id, vehicle_id },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} on vehicle {vehicle_id} is now {to}");
        Ok(vehicle_id)
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Terminal reservations are kept.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let vehicles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for vs in vehicles {
            let guard = vs.read().await;
            if guard.retired {
                continue;
            }
            events.push(Event::VehicleRegistered {
                id: guard.id,
                name: guard.name.clone(),
                inspection_due: guard.inspection_due,
            });
            for interval in &guard.reservations {
                events.push(Event::ReservationConfirmed {
                    id: interval.id,
                    vehicle_id: guard.id,
                    span: interval.span,
                    label: interval.label.clone(),
                });
                match interval.status {
                    IntervalStatus::Active => {}
                    IntervalStatus::Completed => events.push(Event::ReservationCompleted {
                        id: interval.id,
                        vehicle_id: guard.id,
                    }),
                    IntervalStatus::Cancelled => events.push(Event::ReservationCancelled {
                        id: interval.id,
                        vehicle_id: guard.id,
                    }),
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
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
