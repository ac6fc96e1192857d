use ulid::Ulid;

use crate::checker::ConflictResult;
use crate::inspection::{InspectionEntry, inspection_status};
use crate::model::*;

use super::conflict::conflicts_for;
use super::{Engine, EngineError};

impl Engine {
    /// Conflict check against the vehicle's current snapshot. An unknown
    /// vehicle has no reservations and is therefore available.
    pub async fn check_availability(
        &self,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<ConflictResult, EngineError> {
        let span = Span::new(start, end)?;
        let Some(vs) = self.get_vehicle(&vehicle_id) else {
            return Ok(ConflictResult {
                available: true,
                conflicts: Vec::new(),
            });
        };
        let guard = vs.read().await;
        conflicts_for(&guard, &span, exclude)
    }

    pub async fn list_vehicles(&self) -> Vec<VehicleInfo> {
        let vehicles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(vehicles.len());
        for vs in vehicles {
            let guard = vs.read().await;
            if guard.retired {
                continue;
            }
            infos.push(VehicleInfo {
                id: guard.id,
                name: guard.name.clone(),
                inspection_due: guard.inspection_due,
                active_reservations: guard.active_count(),
            });
        }
        infos.sort_by_key(|v| v.id);
        infos
    }

    /// Reservations of one vehicle in start order, optionally filtered by status.
    pub async fn get_reservations(
        &self,
        vehicle_id: Ulid,
        status: Option<IntervalStatus>,
    ) -> Result<Vec<Interval>, EngineError> {
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect())
    }

    /// Reservations across the fleet, ordered by start then vehicle.
    pub async fn all_reservations(&self, status: Option<IntervalStatus>) -> Vec<Interval> {
        let vehicles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::new();
        for vs in vehicles {
            let guard = vs.read().await;
            if guard.retired {
                continue;
            }
            all.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|i| status.is_none_or(|s| i.status == s))
                    .cloned(),
            );
        }
        all.sort_by_key(|i| (i.span.start(), i.resource_id, i.id));
        all
    }

    /// TÜV status of every vehicle, most urgent first.
    pub async fn inspection_report(&self, now: Ms, warn_window: Ms) -> Vec<InspectionEntry> {
        let mut report: Vec<InspectionEntry> = self
            .list_vehicles()
            .await
            .into_iter()
            .map(|v| InspectionEntry {
                status: inspection_status(v.inspection_due, now, warn_window),
                vehicle_id: v.id,
                name: v.name,
                inspection_due: v.inspection_due,
            })
            .collect();
        report.sort_by_key(|e| (e.inspection_due.is_none(), e.inspection_due, e.vehicle_id));
        report
    }
}
