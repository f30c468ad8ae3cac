//! Test helpers for common test setup and utilities.
//!
//! Shared fixtures: a manually advanced clock, a scripted position source and
//! canned domain records.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rust_decimal_macros::dec;

use crate::clock::Clock;
use crate::geo::Position;
use crate::lifecycle::{
    PaymentMethod, PaymentStatus, RideId, RideRequest, RideStatus, RiderId,
};
use crate::matching::{DriverAvailability, VehicleType};
use crate::tracking::{FixOptions, PositionError, PositionSource, RawFix};

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A position source that replays a canned script of fixes and errors.
#[derive(Debug)]
pub struct ScriptedSource {
    script: VecDeque<Result<RawFix, PositionError>>,
    cancelled: AtomicBool,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<RawFix, PositionError>>) -> Self {
        Self {
            script: script.into(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn push(&mut self, entry: Result<RawFix, PositionError>) {
        self.script.push_back(entry);
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl PositionSource for ScriptedSource {
    fn fetch(&mut self, _options: &FixOptions) -> Result<RawFix, PositionError> {
        self.script
            .pop_front()
            .unwrap_or(Err(PositionError::Unavailable("script exhausted".to_owned())))
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

pub fn raw_fix(latitude: f64, longitude: f64, timestamp: u64) -> RawFix {
    RawFix {
        latitude,
        longitude,
        accuracy: 5.0,
        heading: None,
        speed: None,
        timestamp,
    }
}

pub fn test_position(latitude: f64, longitude: f64) -> Position {
    Position::new(latitude, longitude, 0)
}

pub fn position_at(latitude: f64, longitude: f64, timestamp: u64) -> Position {
    Position::new(latitude, longitude, timestamp)
}

pub fn available_driver(id: &str, latitude: f64, longitude: f64) -> DriverAvailability {
    DriverAvailability {
        driver_id: id.into(),
        location: test_position(latitude, longitude),
        is_online: true,
        vehicle_type: VehicleType::Sedan,
        rating: 4.5,
    }
}

/// A pending, unassigned ride over the ~1.2 km reference trip.
pub fn test_ride(rider: &str) -> RideRequest {
    RideRequest {
        id: RideId::new(),
        rider_id: RiderId::from(rider),
        pickup: test_position(0.0, 0.0),
        drop: test_position(0.0, 0.009),
        pickup_address: "Origin St 1".to_owned(),
        drop_address: "Target Ave 2".to_owned(),
        distance_km: 1.2,
        estimated_minutes: 2,
        fare: dec!(4.30),
        final_fare: None,
        status: RideStatus::Pending,
        driver_id: None,
        payment_method: PaymentMethod::Cash,
        payment_status: PaymentStatus::Pending,
        created_at: 0,
        accepted_at: None,
        started_at: None,
        completed_at: None,
        cancelled_at: None,
        cancel_reason: None,
    }
}
