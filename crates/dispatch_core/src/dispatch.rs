//! Dispatch coordination: ride actions, subscriptions and the tracker
//! registry.
//!
//! The coordinator is a stateless relay between the location trackers, the
//! proximity matcher and the ride lifecycle. It holds no long-lived ride
//! state of its own; actors coordinate exclusively through the shared records
//! in the backing store, and the accept race is arbitrated by the store's
//! compare-and-swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::fare::{CommissionSplit, FareCalculator, FareError};
use crate::geo::{GeoDistanceEngine, GeoError, Position};
use crate::lifecycle::{
    check_transition, Actor, DriverId, LifecycleError, PaymentMethod, PaymentStatus, RideAction,
    RideId, RideRequest, RideStatus, RiderId,
};
use crate::matching::{DriverAvailability, ProximityMatcher, RankedDriver, VehicleType};
use crate::pubsub::{Listener, Subscribers, SubscriptionId};
use crate::store::{RideFilter, RideListener, RideStore, RideUpdate, StoreError, Subscription};
use crate::tracking::{LocationTracker, PositionSource, TrackingError};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub match_radius_km: f64,
    /// Average speed used for pickup/trip ETA estimates (km/h).
    pub avg_speed_kmh: f64,
    /// Subscription retry budget against a transiently unavailable store.
    pub subscribe_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            match_radius_km: crate::matching::DEFAULT_MATCH_RADIUS_KM,
            avg_speed_kmh: 40.0,
            subscribe_attempts: 5,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    pub fn with_match_radius_km(mut self, radius_km: f64) -> Self {
        self.match_radius_km = radius_km;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, cap_ms: u64, attempts: u32) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self.subscribe_attempts = attempts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Geo(#[from] GeoError),
    #[error(transparent)]
    Fare(#[from] FareError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error("driver {0} is not online")]
    DriverOffline(DriverId),
    #[error("driver {0} is not registered with this coordinator")]
    UnknownDriver(DriverId),
}

/// One event on the driver position stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPositionEvent {
    pub driver_id: DriverId,
    pub location: Position,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct RegisteredDriver {
    tracker: LocationTracker,
    vehicle_type: VehicleType,
    rating: f64,
}

struct CandidateWatch {
    pickup: Position,
    listener: Listener<Vec<RankedDriver>>,
}

/// Orchestrates trackers, matching and the ride lifecycle against the store.
pub struct DispatchCoordinator {
    store: Arc<dyn RideStore>,
    engine: Arc<GeoDistanceEngine>,
    matcher: ProximityMatcher,
    fare: FareCalculator,
    clock: SharedClock,
    config: DispatchConfig,
    /// Live trackers keyed by driver; an explicit registry, not a process
    /// global. Each entry carries its own lock so one driver's blocking
    /// fetch cannot stall the others.
    trackers: Mutex<HashMap<DriverId, Arc<Mutex<RegisteredDriver>>>>,
    positions: Subscribers<DriverPositionEvent>,
    watches: Mutex<HashMap<WatchId, CandidateWatch>>,
    next_watch: AtomicU64,
}

impl DispatchCoordinator {
    pub fn new(store: Arc<dyn RideStore>, clock: SharedClock) -> Self {
        Self::with_config(
            store,
            Arc::new(GeoDistanceEngine::default()),
            FareCalculator::default(),
            clock,
            DispatchConfig::default(),
        )
    }

    pub fn with_config(
        store: Arc<dyn RideStore>,
        engine: Arc<GeoDistanceEngine>,
        fare: FareCalculator,
        clock: SharedClock,
        config: DispatchConfig,
    ) -> Self {
        let matcher = ProximityMatcher::new(engine.clone()).with_radius_km(config.match_radius_km);
        Self {
            store,
            engine,
            matcher,
            fare,
            clock,
            config,
            trackers: Mutex::new(HashMap::new()),
            positions: Subscribers::new(),
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &GeoDistanceEngine {
        &self.engine
    }

    // ---- ride actions -----------------------------------------------------

    /// Create a pending ride request. Distance and fare are computed once
    /// here and frozen on the record.
    #[allow(clippy::too_many_arguments)]
    pub fn request_ride(
        &self,
        rider: RiderId,
        pickup: Position,
        drop: Position,
        pickup_address: String,
        drop_address: String,
        payment_method: PaymentMethod,
    ) -> Result<RideRequest, DispatchError> {
        let distance_km = self.engine.distance_km(&pickup, &drop, true)?;
        let fare = self.fare.estimate(distance_km)?;
        let estimated_minutes = ((distance_km / self.config.avg_speed_kmh) * 60.0).ceil() as u32;

        let ride = RideRequest {
            id: RideId::new(),
            rider_id: rider,
            pickup,
            drop,
            pickup_address,
            drop_address,
            distance_km,
            estimated_minutes,
            fare,
            final_fare: None,
            status: RideStatus::Pending,
            driver_id: None,
            payment_method,
            payment_status: PaymentStatus::Pending,
            created_at: self.clock.now_ms(),
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
        };
        self.store.upsert_ride(&ride)?;
        info!(ride_id = %ride.id, distance_km, %ride.fare, "ride requested");
        Ok(ride)
    }

    /// Claim a pending ride for a driver.
    ///
    /// The claim is a compare-and-swap conditioned on `status == pending`;
    /// when two drivers race, exactly one succeeds and the other gets
    /// [`LifecycleError::AlreadyAssigned`].
    pub fn accept_ride(
        &self,
        ride_id: RideId,
        driver: &DriverId,
    ) -> Result<RideRequest, DispatchError> {
        let online = self
            .store
            .availability(driver)?
            .map(|a| a.is_online)
            .unwrap_or(false);
        if !online {
            return Err(DispatchError::DriverOffline(driver.clone()));
        }

        let ride = self.store.ride(ride_id)?;
        let action = RideAction::Accept {
            driver: driver.clone(),
        };
        check_transition(&ride, &action)?;

        let mut update = RideUpdate::to_status(RideStatus::Accepted);
        update.driver_id = Some(driver.clone());
        update.accepted_at = Some(self.clock.now_ms());

        match self
            .store
            .compare_and_update(ride_id, RideStatus::Pending, update)
        {
            Ok(accepted) => {
                info!(ride_id = %ride_id, driver_id = %driver, "ride accepted");
                Ok(accepted)
            }
            Err(StoreError::Conflict { actual }) => Err(Self::map_accept_conflict(actual).into()),
            Err(err) => Err(err.into()),
        }
    }

    fn map_accept_conflict(actual: RideStatus) -> LifecycleError {
        match actual {
            // Someone else holds (or held) the assignment.
            RideStatus::Accepted | RideStatus::InProgress | RideStatus::Completed => {
                LifecycleError::AlreadyAssigned
            }
            _ => LifecycleError::InvalidTransition {
                from: actual,
                action: "accept",
            },
        }
    }

    /// Begin the trip. Only the assigned driver may start it.
    pub fn start_ride(
        &self,
        ride_id: RideId,
        driver: &DriverId,
    ) -> Result<RideRequest, DispatchError> {
        let ride = self.store.ride(ride_id)?;
        let action = RideAction::Start {
            driver: driver.clone(),
        };
        check_transition(&ride, &action)?;

        let mut update = RideUpdate::to_status(RideStatus::InProgress);
        update.started_at = Some(self.clock.now_ms());
        self.conditional(ride_id, RideStatus::Accepted, update, "start")
    }

    /// Finish the trip: compute the final fare, split the commission and
    /// credit the driver's aggregate counters in one atomic increment.
    pub fn complete_ride(
        &self,
        ride_id: RideId,
        driver: &DriverId,
    ) -> Result<CommissionSplit, DispatchError> {
        let ride = self.store.ride(ride_id)?;
        let action = RideAction::Complete {
            driver: driver.clone(),
        };
        check_transition(&ride, &action)?;

        let split = self.fare.finalize(ride.distance_km)?;
        let mut update = RideUpdate::to_status(RideStatus::Completed);
        update.completed_at = Some(self.clock.now_ms());
        update.final_fare = Some(split.gross_fare);
        if ride.payment_method == PaymentMethod::Cash {
            update.payment_status = Some(PaymentStatus::Collected);
        }

        self.conditional(ride_id, RideStatus::InProgress, update, "complete")?;
        let stats = self.store.credit_driver(driver, &split)?;
        info!(
            ride_id = %ride_id,
            driver_id = %driver,
            gross = %split.gross_fare,
            earnings = %split.driver_earnings,
            total_rides = stats.total_rides,
            "ride completed"
        );
        Ok(split)
    }

    /// Cancel a pending or accepted ride. Only the requesting rider or the
    /// assigned driver may cancel.
    pub fn cancel_ride(
        &self,
        ride_id: RideId,
        actor: Actor,
        reason: &str,
    ) -> Result<RideRequest, DispatchError> {
        let ride = self.store.ride(ride_id)?;
        let action = RideAction::Cancel {
            actor,
            reason: reason.to_owned(),
        };
        check_transition(&ride, &action)?;

        let mut update = RideUpdate::to_status(RideStatus::Cancelled);
        update.cancelled_at = Some(self.clock.now_ms());
        update.cancel_reason = Some(reason.to_owned());
        self.conditional(ride_id, ride.status, update, "cancel")
    }

    fn conditional(
        &self,
        ride_id: RideId,
        expected: RideStatus,
        update: RideUpdate,
        action: &'static str,
    ) -> Result<RideRequest, DispatchError> {
        match self.store.compare_and_update(ride_id, expected, update) {
            Ok(ride) => Ok(ride),
            Err(StoreError::Conflict { actual }) => {
                Err(LifecycleError::InvalidTransition {
                    from: actual,
                    action,
                }
                .into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Snapshot of every ride currently waiting for a driver.
    pub fn pending_rides(&self) -> Result<Vec<RideRequest>, DispatchError> {
        Ok(self.store.rides_with_status(RideStatus::Pending)?)
    }

    /// The rider's current ride, if any is still pending, accepted or in
    /// progress.
    pub fn active_ride(&self, rider: &RiderId) -> Result<Option<RideRequest>, DispatchError> {
        Ok(self.store.active_ride_for(rider)?)
    }

    // ---- subscriptions ----------------------------------------------------

    /// Pending-ride feed for online drivers.
    pub fn subscribe_pending_rides(
        &self,
        listener: RideListener,
    ) -> Result<Subscription, DispatchError> {
        self.subscribe_with_backoff(RideFilter::Status(RideStatus::Pending), listener)
    }

    /// The rider's own active ride (pending, accepted or in progress).
    pub fn subscribe_active_ride(
        &self,
        rider: RiderId,
        listener: RideListener,
    ) -> Result<Subscription, DispatchError> {
        self.subscribe_with_backoff(RideFilter::ActiveForRider(rider), listener)
    }

    /// Subscribe, retrying transient store failures with capped exponential
    /// backoff plus jitter. Never retries without a delay.
    fn subscribe_with_backoff(
        &self,
        filter: RideFilter,
        listener: RideListener,
    ) -> Result<Subscription, DispatchError> {
        let mut attempt = 0u32;
        loop {
            match self.store.subscribe(filter.clone(), listener.clone()) {
                Ok(id) => return Ok(Subscription::new(self.store.clone(), id)),
                Err(StoreError::Unavailable(reason))
                    if attempt + 1 < self.config.subscribe_attempts =>
                {
                    let delay = self.backoff_delay(attempt);
                    warn!(%reason, attempt, ?delay, "store subscribe failed, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.backoff_cap_ms);
        // Equal jitter: half fixed, half random.
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp / 2 + jitter)
    }

    /// Subscribe to the driver position stream.
    pub fn subscribe_driver_positions(
        &self,
        listener: Listener<DriverPositionEvent>,
    ) -> SubscriptionId {
        self.positions.subscribe(listener)
    }

    pub fn unsubscribe_driver_positions(&self, id: SubscriptionId) {
        self.positions.unsubscribe(id)
    }

    /// Watch ranked candidates around a pickup point; re-emitted on every
    /// driver position update. Emits the current ranking immediately.
    pub fn watch_candidates(
        &self,
        pickup: Position,
        listener: Listener<Vec<RankedDriver>>,
    ) -> Result<WatchId, DispatchError> {
        let initial = self.candidates_near(&pickup)?;
        listener(&initial);

        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut watches) = self.watches.lock() {
            watches.insert(id, CandidateWatch { pickup, listener });
        }
        Ok(id)
    }

    pub fn unwatch_candidates(&self, id: WatchId) {
        if let Ok(mut watches) = self.watches.lock() {
            watches.remove(&id);
        }
    }

    /// One-shot candidate query around a pickup point.
    pub fn candidates_near(&self, pickup: &Position) -> Result<Vec<RankedDriver>, DispatchError> {
        let drivers = self.store.online_drivers()?;
        Ok(self.matcher.find_candidates(pickup, &drivers)?)
    }

    // ---- tracker registry -------------------------------------------------

    /// Register a driver's position source and start tracking.
    pub fn register_driver(
        &self,
        driver: DriverId,
        vehicle_type: VehicleType,
        rating: f64,
        source: Box<dyn PositionSource>,
    ) -> Result<(), DispatchError> {
        let mut tracker = LocationTracker::new(source, self.clock.clone());
        tracker.start();
        if let Ok(mut trackers) = self.trackers.lock() {
            trackers.insert(
                driver.clone(),
                Arc::new(Mutex::new(RegisteredDriver {
                    tracker,
                    vehicle_type,
                    rating,
                })),
            );
        }
        debug!(driver_id = %driver, "driver registered");
        Ok(())
    }

    /// Stop tracking and mark the driver offline.
    pub fn unregister_driver(&self, driver: &DriverId) -> Result<(), DispatchError> {
        let removed = match self.trackers.lock() {
            Ok(mut trackers) => trackers.remove(driver),
            Err(_) => None,
        };
        if let Some(entry) = removed {
            if let Ok(mut registered) = entry.lock() {
                registered.tracker.stop();
            }
        }
        self.set_driver_online(driver, false)?;
        debug!(driver_id = %driver, "driver unregistered");
        Ok(())
    }

    /// Flip the driver's availability flag on the stored record.
    pub fn set_driver_online(&self, driver: &DriverId, online: bool) -> Result<(), DispatchError> {
        if let Some(mut availability) = self.store.availability(driver)? {
            availability.is_online = online;
            self.store.upsert_availability(&availability)?;
        }
        Ok(())
    }

    /// Poll the driver's tracker once and propagate any delivered position:
    /// availability record, position stream, candidate watches.
    pub fn poll_driver(&self, driver: &DriverId) -> Result<Option<Position>, DispatchError> {
        let entry = {
            let trackers = self
                .trackers
                .lock()
                .map_err(|_| StoreError::Unavailable("tracker registry poisoned".to_owned()))?;
            trackers
                .get(driver)
                .cloned()
                .ok_or_else(|| DispatchError::UnknownDriver(driver.clone()))?
        };
        // Registry lock released; only this driver's entry is held across
        // the blocking fetch.
        let (position, vehicle_type, rating) = {
            let mut registered = entry
                .lock()
                .map_err(|_| StoreError::Unavailable("tracker entry poisoned".to_owned()))?;
            let position = registered.tracker.poll();
            (position, registered.vehicle_type, registered.rating)
        };

        let position = match position {
            Ok(position) => position,
            Err(TrackingError::LocationUnavailable) => {
                // Terminal for the session; the driver drops off the map.
                self.set_driver_online(driver, false)?;
                return Err(TrackingError::LocationUnavailable.into());
            }
            Err(err) => return Err(err.into()),
        };

        let Some(position) = position else {
            return Ok(None);
        };

        self.store.upsert_availability(&DriverAvailability {
            driver_id: driver.clone(),
            location: position,
            is_online: true,
            vehicle_type,
            rating,
        })?;
        self.positions.emit(&DriverPositionEvent {
            driver_id: driver.clone(),
            location: position,
            timestamp: position.timestamp,
        });
        self.refresh_watches();
        Ok(Some(position))
    }

    fn refresh_watches(&self) {
        let watches: Vec<(Position, Listener<Vec<RankedDriver>>)> = match self.watches.lock() {
            Ok(watches) => watches
                .values()
                .map(|w| (w.pickup, w.listener.clone()))
                .collect(),
            Err(_) => return,
        };
        for (pickup, listener) in watches {
            match self.candidates_near(&pickup) {
                Ok(candidates) => listener(&candidates),
                Err(err) => warn!(%err, "candidate refresh failed"),
            }
        }
    }
}

impl std::fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Barrier};

    use rust_decimal_macros::dec;

    use super::*;
    use crate::store::InMemoryStore;
    use crate::test_helpers::{
        available_driver, raw_fix, test_position, ManualClock, ScriptedSource,
    };
    use crate::tracking::{FixOptions, PositionError, RawFix};

    fn coordinator() -> (Arc<DispatchCoordinator>, Arc<InMemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let coordinator = Arc::new(DispatchCoordinator::new(store.clone(), clock.clone()));
        (coordinator, store, clock)
    }

    fn reference_ride(coordinator: &DispatchCoordinator) -> RideRequest {
        coordinator
            .request_ride(
                RiderId::from("rider-1"),
                test_position(0.0, 0.0),
                test_position(0.0, 0.009),
                "Origin St 1".to_owned(),
                "Target Ave 2".to_owned(),
                PaymentMethod::Cash,
            )
            .expect("request ride")
    }

    fn put_online_driver(store: &InMemoryStore, id: &str) {
        store
            .upsert_availability(&available_driver(id, 0.001, 0.001))
            .expect("availability");
    }

    #[test]
    fn request_ride_freezes_distance_fare_and_eta() {
        let (coordinator, store, _) = coordinator();
        let ride = reference_ride(&coordinator);

        assert_eq!(ride.status, RideStatus::Pending);
        assert!(ride.driver_id.is_none());
        assert!((ride.distance_km - 1.2).abs() < 0.015, "km {}", ride.distance_km);
        let expected_fare = FareCalculator::default()
            .estimate(ride.distance_km)
            .expect("fare");
        assert_eq!(ride.fare, expected_fare);
        assert_eq!(ride.estimated_minutes, 2);
        assert_eq!(ride.created_at, 1_000);

        let stored = store.ride(ride.id).expect("stored ride");
        assert_eq!(stored, ride);

        let pending = coordinator.pending_rides().expect("pending rides");
        assert_eq!(pending, [ride.clone()]);
        let active = coordinator
            .active_ride(&RiderId::from("rider-1"))
            .expect("active ride");
        assert_eq!(active, Some(ride));
    }

    #[test]
    fn accept_requires_an_online_driver() {
        let (coordinator, store, _) = coordinator();
        let ride = reference_ride(&coordinator);
        let driver = DriverId::from("d1");

        // Unknown driver.
        assert_eq!(
            coordinator.accept_ride(ride.id, &driver),
            Err(DispatchError::DriverOffline(driver.clone()))
        );

        // Known but offline.
        let mut availability = available_driver("d1", 0.001, 0.001);
        availability.is_online = false;
        store.upsert_availability(&availability).expect("availability");
        assert_eq!(
            coordinator.accept_ride(ride.id, &driver),
            Err(DispatchError::DriverOffline(driver))
        );
    }

    #[test]
    fn two_racing_accepts_produce_exactly_one_winner() {
        let (coordinator, store, _) = coordinator();
        let ride = reference_ride(&coordinator);
        put_online_driver(&store, "d1");
        put_online_driver(&store, "d2");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["d1", "d2"]
            .into_iter()
            .map(|id| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                let driver = DriverId::from(id);
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator.accept_ride(ride.id, &driver)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one accept succeeds");
        let loser = results
            .iter()
            .find(|r| r.is_err())
            .expect("one loser")
            .clone()
            .expect_err("loser error");
        assert_eq!(
            loser,
            DispatchError::Lifecycle(LifecycleError::AlreadyAssigned)
        );

        let final_ride = store.ride(ride.id).expect("ride");
        assert_eq!(final_ride.status, RideStatus::Accepted);
        let assigned = final_ride.driver_id.expect("assigned driver");
        assert!(assigned == DriverId::from("d1") || assigned == DriverId::from("d2"));
    }

    #[test]
    fn full_lifecycle_completes_with_split_and_earnings() {
        let (coordinator, store, clock) = coordinator();
        let ride = reference_ride(&coordinator);
        put_online_driver(&store, "d1");
        let driver = DriverId::from("d1");

        clock.set_ms(2_000);
        let accepted = coordinator.accept_ride(ride.id, &driver).expect("accept");
        assert_eq!(accepted.accepted_at, Some(2_000));

        clock.set_ms(3_000);
        let started = coordinator.start_ride(ride.id, &driver).expect("start");
        assert_eq!(started.status, RideStatus::InProgress);
        assert_eq!(started.started_at, Some(3_000));

        clock.set_ms(4_000);
        let split = coordinator.complete_ride(ride.id, &driver).expect("complete");
        assert_eq!(split.platform_cut + split.driver_earnings, split.gross_fare);

        let completed = store.ride(ride.id).expect("ride");
        assert_eq!(completed.status, RideStatus::Completed);
        assert_eq!(completed.completed_at, Some(4_000));
        assert_eq!(completed.final_fare, Some(split.gross_fare));
        // The original estimate is frozen, never rewritten.
        assert_eq!(completed.fare, ride.fare);
        // Cash is collected on completion.
        assert_eq!(completed.payment_status, PaymentStatus::Collected);

        let stats = store.driver_stats(&driver).expect("stats");
        assert_eq!(stats.total_rides, 1);
        assert_eq!(stats.today_earnings, split.driver_earnings);
    }

    #[test]
    fn only_the_assigned_driver_may_start_or_complete() {
        let (coordinator, store, _) = coordinator();
        let ride = reference_ride(&coordinator);
        put_online_driver(&store, "d1");
        let driver = DriverId::from("d1");
        let intruder = DriverId::from("d9");

        coordinator.accept_ride(ride.id, &driver).expect("accept");
        assert!(matches!(
            coordinator.start_ride(ride.id, &intruder),
            Err(DispatchError::Lifecycle(LifecycleError::NotAuthorized { .. }))
        ));

        coordinator.start_ride(ride.id, &driver).expect("start");
        assert!(matches!(
            coordinator.complete_ride(ride.id, &intruder),
            Err(DispatchError::Lifecycle(LifecycleError::NotAuthorized { .. }))
        ));
    }

    #[test]
    fn rider_cancels_pending_but_not_in_progress() {
        let (coordinator, store, _) = coordinator();
        let rider = Actor::Rider(RiderId::from("rider-1"));

        let ride = reference_ride(&coordinator);
        let cancelled = coordinator
            .cancel_ride(ride.id, rider.clone(), "changed plans")
            .expect("cancel");
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed plans"));
        assert!(cancelled.cancelled_at.is_some());

        // A new ride taken all the way to in-progress cannot be cancelled.
        let ride = reference_ride(&coordinator);
        put_online_driver(&store, "d1");
        let driver = DriverId::from("d1");
        coordinator.accept_ride(ride.id, &driver).expect("accept");
        coordinator.start_ride(ride.id, &driver).expect("start");
        assert!(matches!(
            coordinator.cancel_ride(ride.id, rider, "too late"),
            Err(DispatchError::Lifecycle(LifecycleError::InvalidTransition { .. }))
        ));
    }

    #[test]
    fn scenario_e_hundred_unit_gross_splits_ten_ninety() {
        let calc = FareCalculator::default();
        let split = calc.split(dec!(100.00));
        assert_eq!(split.platform_cut, dec!(10.00));
        assert_eq!(split.driver_earnings, dec!(90.00));
    }

    #[test]
    fn poll_driver_feeds_availability_stream_and_watches() {
        let (coordinator, store, _) = coordinator();
        let driver = DriverId::from("d1");
        let source = ScriptedSource::new(vec![Ok(raw_fix(0.001, 0.001, 5_000))]);
        coordinator
            .register_driver(driver.clone(), VehicleType::Sedan, 4.8, Box::new(source))
            .expect("register");

        let stream_events = Arc::new(AtomicUsize::new(0));
        let sink = stream_events.clone();
        coordinator.subscribe_driver_positions(Arc::new(move |event: &DriverPositionEvent| {
            assert_eq!(event.driver_id, DriverId::from("d1"));
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        let watch_hits = Arc::new(AtomicUsize::new(0));
        let sink = watch_hits.clone();
        coordinator
            .watch_candidates(
                test_position(0.0, 0.0),
                Arc::new(move |_candidates: &Vec<RankedDriver>| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("watch");
        // Initial emit with no drivers online yet.
        assert_eq!(watch_hits.load(Ordering::SeqCst), 1);

        let position = coordinator
            .poll_driver(&driver)
            .expect("poll")
            .expect("delivered fix");
        assert_eq!(position.timestamp, 5_000);

        let availability = store
            .availability(&driver)
            .expect("availability")
            .expect("record");
        assert!(availability.is_online);
        assert_eq!(availability.rating, 4.8);
        assert_eq!(stream_events.load(Ordering::SeqCst), 1);
        assert_eq!(watch_hits.load(Ordering::SeqCst), 2);

        // The driver now ranks as a candidate near the pickup.
        let candidates = coordinator
            .candidates_near(&test_position(0.0, 0.0))
            .expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].driver.driver_id, driver);
    }

    #[test]
    fn terminal_tracker_error_marks_the_driver_offline() {
        let (coordinator, store, _) = coordinator();
        let driver = DriverId::from("d1");
        put_online_driver(&store, "d1");
        let source = ScriptedSource::new(vec![Err(PositionError::PermissionDenied)]);
        coordinator
            .register_driver(driver.clone(), VehicleType::Sedan, 4.8, Box::new(source))
            .expect("register");

        let err = coordinator.poll_driver(&driver).expect_err("terminal");
        assert_eq!(
            err,
            DispatchError::Tracking(TrackingError::LocationUnavailable)
        );
        let availability = store
            .availability(&driver)
            .expect("availability")
            .expect("record");
        assert!(!availability.is_online);
    }

    #[test]
    fn unknown_driver_poll_is_an_error() {
        let (coordinator, _, _) = coordinator();
        let driver = DriverId::from("ghost");
        assert_eq!(
            coordinator.poll_driver(&driver),
            Err(DispatchError::UnknownDriver(driver))
        );
    }

    #[test]
    fn unregister_stops_tracking_and_goes_offline() {
        let (coordinator, store, _) = coordinator();
        let driver = DriverId::from("d1");
        let source = ScriptedSource::new(vec![Ok(raw_fix(0.001, 0.001, 5_000))]);
        coordinator
            .register_driver(driver.clone(), VehicleType::Sedan, 4.8, Box::new(source))
            .expect("register");
        coordinator.poll_driver(&driver).expect("poll");

        coordinator.unregister_driver(&driver).expect("unregister");
        let availability = store
            .availability(&driver)
            .expect("availability")
            .expect("record");
        assert!(!availability.is_online);
        assert_eq!(
            coordinator.poll_driver(&driver),
            Err(DispatchError::UnknownDriver(driver))
        );
    }

    // A source that parks inside fetch until a fix is sent.
    struct BlockingSource {
        entered: mpsc::Sender<()>,
        fixes: mpsc::Receiver<RawFix>,
    }

    impl PositionSource for BlockingSource {
        fn fetch(&mut self, _options: &FixOptions) -> Result<RawFix, PositionError> {
            let _ = self.entered.send(());
            self.fixes
                .recv()
                .map_err(|_| PositionError::Unavailable("source closed".to_owned()))
        }
    }

    #[test]
    fn one_blocked_fetch_does_not_stall_other_drivers() {
        let (coordinator, _store, _) = coordinator();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (fix_tx, fix_rx) = mpsc::channel();
        coordinator
            .register_driver(
                DriverId::from("d-slow"),
                VehicleType::Sedan,
                4.0,
                Box::new(BlockingSource {
                    entered: entered_tx,
                    fixes: fix_rx,
                }),
            )
            .expect("register");
        coordinator
            .register_driver(
                DriverId::from("d-fast"),
                VehicleType::Sedan,
                4.8,
                Box::new(ScriptedSource::new(vec![Ok(raw_fix(0.001, 0.001, 5_000))])),
            )
            .expect("register");

        let slow = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.poll_driver(&DriverId::from("d-slow")))
        };
        entered_rx.recv().expect("slow fetch in flight");

        // The slow driver is parked inside its fetch; this poll must still
        // finish.
        let position = coordinator
            .poll_driver(&DriverId::from("d-fast"))
            .expect("poll")
            .expect("fix");
        assert_eq!(position.timestamp, 5_000);

        fix_tx.send(raw_fix(0.002, 0.002, 6_000)).expect("release");
        let slow_position = slow
            .join()
            .expect("thread")
            .expect("poll")
            .expect("fix");
        assert_eq!(slow_position.timestamp, 6_000);
    }

    // A store wrapper whose subscribe fails transiently.
    struct FlakyStore {
        inner: InMemoryStore,
        failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(times: usize) -> Self {
            Self {
                inner: InMemoryStore::new(),
                failures_left: AtomicUsize::new(times),
            }
        }
    }

    impl RideStore for FlakyStore {
        fn upsert_ride(&self, ride: &RideRequest) -> Result<(), StoreError> {
            self.inner.upsert_ride(ride)
        }
        fn ride(&self, id: RideId) -> Result<RideRequest, StoreError> {
            self.inner.ride(id)
        }
        fn rides_with_status(&self, status: RideStatus) -> Result<Vec<RideRequest>, StoreError> {
            self.inner.rides_with_status(status)
        }
        fn active_ride_for(&self, rider: &RiderId) -> Result<Option<RideRequest>, StoreError> {
            self.inner.active_ride_for(rider)
        }
        fn compare_and_update(
            &self,
            id: RideId,
            expected: RideStatus,
            update: RideUpdate,
        ) -> Result<RideRequest, StoreError> {
            self.inner.compare_and_update(id, expected, update)
        }
        fn credit_driver(
            &self,
            driver: &DriverId,
            split: &CommissionSplit,
        ) -> Result<crate::lifecycle::DriverStats, StoreError> {
            self.inner.credit_driver(driver, split)
        }
        fn driver_stats(
            &self,
            driver: &DriverId,
        ) -> Result<crate::lifecycle::DriverStats, StoreError> {
            self.inner.driver_stats(driver)
        }
        fn upsert_availability(
            &self,
            availability: &DriverAvailability,
        ) -> Result<(), StoreError> {
            self.inner.upsert_availability(availability)
        }
        fn availability(
            &self,
            driver: &DriverId,
        ) -> Result<Option<DriverAvailability>, StoreError> {
            self.inner.availability(driver)
        }
        fn online_drivers(&self) -> Result<Vec<DriverAvailability>, StoreError> {
            self.inner.online_drivers()
        }
        fn subscribe(
            &self,
            filter: RideFilter,
            listener: RideListener,
        ) -> Result<SubscriptionId, StoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("flaky".to_owned()));
            }
            self.inner.subscribe(filter, listener)
        }
        fn unsubscribe(&self, id: SubscriptionId) {
            self.inner.unsubscribe(id)
        }
    }

    #[test]
    fn subscribe_retries_transient_store_failures_with_backoff() {
        let store = Arc::new(FlakyStore::failing(2));
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = DispatchCoordinator::with_config(
            store,
            Arc::new(GeoDistanceEngine::default()),
            FareCalculator::default(),
            clock,
            DispatchConfig::default().with_backoff(1, 4, 5),
        );

        let subscription = coordinator
            .subscribe_pending_rides(Arc::new(|_change| {}))
            .expect("subscription after retries");
        drop(subscription);
    }

    #[test]
    fn subscribe_gives_up_after_the_retry_budget() {
        let store = Arc::new(FlakyStore::failing(10));
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = DispatchCoordinator::with_config(
            store,
            Arc::new(GeoDistanceEngine::default()),
            FareCalculator::default(),
            clock,
            DispatchConfig::default().with_backoff(1, 4, 3),
        );

        let err = coordinator
            .subscribe_pending_rides(Arc::new(|_change| {}))
            .expect_err("budget exhausted");
        assert!(matches!(err, DispatchError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn active_ride_subscription_follows_the_rider() {
        let (coordinator, store, _) = coordinator();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let subscription = coordinator
            .subscribe_active_ride(
                RiderId::from("rider-1"),
                Arc::new(move |_change| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("subscribe");

        let ride = reference_ride(&coordinator);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Dropping the guard unsubscribes; later changes go unseen.
        drop(subscription);
        put_online_driver(&store, "d1");
        coordinator
            .accept_ride(ride.id, &DriverId::from("d1"))
            .expect("accept");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
