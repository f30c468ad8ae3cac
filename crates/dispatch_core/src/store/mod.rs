//! Real-time document store contract.
//!
//! The persistent store is an external collaborator; this module defines the
//! read/write + subscribe contract the core consumes, plus an in-memory
//! reference implementation used by tests and as contract documentation.
//!
//! The one hard ordering requirement in the whole system lives here:
//! [`RideStore::compare_and_update`] must be transactional, so that two
//! drivers racing to accept the same pending ride cannot both win.

pub mod memory;

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::fare::CommissionSplit;
use crate::lifecycle::{
    DriverId, DriverStats, PaymentStatus, RideId, RideRequest, RideStatus, RiderId,
};
use crate::matching::DriverAvailability;
use crate::pubsub::SubscriptionId;

pub use memory::InMemoryStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("ride {0} not found")]
    NotFound(RideId),
    /// Conditional update failed: the record moved underneath the caller.
    #[error("conditional update failed, ride status is {actual}")]
    Conflict { actual: RideStatus },
    /// Transient failure; callers retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Field writes applied together with a status change in one conditional
/// update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RideUpdate {
    pub status: Option<RideStatus>,
    pub driver_id: Option<DriverId>,
    pub accepted_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub cancelled_at: Option<u64>,
    pub cancel_reason: Option<String>,
    pub final_fare: Option<Decimal>,
    pub payment_status: Option<PaymentStatus>,
}

impl RideUpdate {
    pub fn to_status(status: RideStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, ride: &mut RideRequest) {
        if let Some(status) = self.status {
            ride.status = status;
        }
        if let Some(driver_id) = &self.driver_id {
            ride.driver_id = Some(driver_id.clone());
        }
        if let Some(ts) = self.accepted_at {
            ride.accepted_at = Some(ts);
        }
        if let Some(ts) = self.started_at {
            ride.started_at = Some(ts);
        }
        if let Some(ts) = self.completed_at {
            ride.completed_at = Some(ts);
        }
        if let Some(ts) = self.cancelled_at {
            ride.cancelled_at = Some(ts);
        }
        if let Some(reason) = &self.cancel_reason {
            ride.cancel_reason = Some(reason.clone());
        }
        if let Some(fare) = self.final_fare {
            ride.final_fare = Some(fare);
        }
        if let Some(payment_status) = self.payment_status {
            ride.payment_status = payment_status;
        }
    }
}

/// What a subscription matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RideFilter {
    /// Every ride currently in the given status (the driver-side pending
    /// feed).
    Status(RideStatus),
    /// The rider's own ride while it is pending, accepted or in progress.
    ActiveForRider(RiderId),
}

impl RideFilter {
    pub fn matches(&self, ride: &RideRequest) -> bool {
        match self {
            RideFilter::Status(status) => ride.status == *status,
            RideFilter::ActiveForRider(rider) => {
                ride.rider_id == *rider && ride.status.is_active()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    /// The record left the subscription's result set. The carried ride is
    /// the post-change state, so a terminal transition arrives with its
    /// final status instead of vanishing.
    Removed,
}

/// A change notification pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct RideChange {
    pub kind: ChangeKind,
    pub ride: RideRequest,
}

pub type RideListener = Arc<dyn Fn(&RideChange) + Send + Sync>;

/// The store contract consumed by the dispatch layer.
pub trait RideStore: Send + Sync {
    fn upsert_ride(&self, ride: &RideRequest) -> Result<(), StoreError>;

    fn ride(&self, id: RideId) -> Result<RideRequest, StoreError>;

    fn rides_with_status(&self, status: RideStatus) -> Result<Vec<RideRequest>, StoreError>;

    fn active_ride_for(&self, rider: &RiderId) -> Result<Option<RideRequest>, StoreError>;

    /// Atomic conditional update: applies `update` only while the ride's
    /// status equals `expected`, otherwise fails with
    /// [`StoreError::Conflict`] carrying the actual status. Status and the
    /// other fields are written together or not at all.
    fn compare_and_update(
        &self,
        id: RideId,
        expected: RideStatus,
        update: RideUpdate,
    ) -> Result<RideRequest, StoreError>;

    /// Atomically fold a completed trip's earnings into the driver's
    /// aggregate counters.
    fn credit_driver(
        &self,
        driver: &DriverId,
        split: &CommissionSplit,
    ) -> Result<DriverStats, StoreError>;

    fn driver_stats(&self, driver: &DriverId) -> Result<DriverStats, StoreError>;

    fn upsert_availability(&self, availability: &DriverAvailability) -> Result<(), StoreError>;

    fn availability(&self, driver: &DriverId) -> Result<Option<DriverAvailability>, StoreError>;

    fn online_drivers(&self) -> Result<Vec<DriverAvailability>, StoreError>;

    fn subscribe(
        &self,
        filter: RideFilter,
        listener: RideListener,
    ) -> Result<SubscriptionId, StoreError>;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// A live subscription that unsubscribes when dropped, so a ride session
/// ending cannot leave orphaned listeners registered against the store.
pub struct Subscription {
    store: Arc<dyn RideStore>,
    id: SubscriptionId,
}

impl Subscription {
    pub fn new(store: Arc<dyn RideStore>, id: SubscriptionId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
