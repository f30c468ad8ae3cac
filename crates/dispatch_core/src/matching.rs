//! Proximity matching: candidate drivers around a pickup point.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geo::{GeoDistanceEngine, GeoError, Position};
use crate::lifecycle::DriverId;

/// Default search radius around the pickup point.
pub const DEFAULT_MATCH_RADIUS_KM: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Sedan,
    Suv,
    Bike,
    Auto,
}

/// A driver's live availability record.
///
/// Single-writer (the owning driver's tracker), multi-reader (every rider
/// currently matching).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAvailability {
    pub driver_id: DriverId,
    pub location: Position,
    pub is_online: bool,
    pub vehicle_type: VehicleType,
    pub rating: f64,
}

/// A candidate driver with the road distance used for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedDriver {
    pub driver: DriverAvailability,
    pub distance_km: f64,
}

/// Filters and ranks available drivers around a pickup point.
///
/// The result is a ranking, not merely a filter: ascending distance, ties
/// broken by rating descending, then by driver id for determinism, so the
/// dispatch UI can present the closest driver first.
#[derive(Debug, Clone)]
pub struct ProximityMatcher {
    engine: Arc<GeoDistanceEngine>,
    radius_km: f64,
}

impl ProximityMatcher {
    pub fn new(engine: Arc<GeoDistanceEngine>) -> Self {
        Self {
            engine,
            radius_km: DEFAULT_MATCH_RADIUS_KM,
        }
    }

    pub fn with_radius_km(mut self, radius_km: f64) -> Self {
        self.radius_km = radius_km;
        self
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    /// Candidate drivers within the radius, closest first.
    ///
    /// Distances go through the engine with caching enabled. An invalid
    /// pickup is a hard error; a driver record with invalid coordinates is
    /// skipped rather than failing the whole query.
    pub fn find_candidates(
        &self,
        pickup: &Position,
        drivers: &[DriverAvailability],
    ) -> Result<Vec<RankedDriver>, GeoError> {
        // Surface pickup validation before touching any driver record.
        self.engine.distance_km(pickup, pickup, false)?;

        let mut candidates: Vec<RankedDriver> = Vec::new();
        for driver in drivers {
            if !driver.is_online {
                continue;
            }
            let distance_km = match self.engine.distance_km(pickup, &driver.location, true) {
                Ok(km) => km,
                Err(err) => {
                    warn!(driver_id = %driver.driver_id, %err, "skipping driver with bad location");
                    continue;
                }
            };
            if distance_km <= self.radius_km {
                candidates.push(RankedDriver {
                    driver: driver.clone(),
                    distance_km,
                });
            }
        }

        candidates.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.driver
                        .rating
                        .partial_cmp(&a.driver.rating)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.driver.driver_id.cmp(&b.driver.driver_id))
        });
        Ok(candidates)
    }
}
