//! Mutex-guarded in-memory store.
//!
//! Reference implementation of the [`RideStore`] contract: conditional
//! updates happen under one lock, so they are observably atomic, and change
//! notifications fire synchronously after the lock is released.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::fare::CommissionSplit;
use crate::lifecycle::{DriverId, DriverStats, RideId, RideRequest, RideStatus, RiderId};
use crate::matching::DriverAvailability;
use crate::pubsub::SubscriptionId;

use super::{ChangeKind, RideChange, RideFilter, RideListener, RideStore, RideUpdate, StoreError};

#[derive(Default)]
struct Inner {
    rides: HashMap<RideId, RideRequest>,
    stats: HashMap<DriverId, DriverStats>,
    availability: HashMap<DriverId, DriverAvailability>,
    subscribers: HashMap<SubscriptionId, (RideFilter, RideListener)>,
    next_subscription: u64,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_owned()))
    }

    /// Collect matching listeners under the lock, invoke them after it is
    /// released: a listener may re-enter the store.
    ///
    /// A subscriber whose filter matched the record before the change but no
    /// longer does still hears about it, as [`ChangeKind::Removed`].
    fn notify(&self, before: Option<&RideRequest>, kind: ChangeKind, ride: &RideRequest) {
        let listeners: Vec<(ChangeKind, RideListener)> = match self.inner.lock() {
            Ok(inner) => inner
                .subscribers
                .values()
                .filter_map(|(filter, listener)| {
                    if filter.matches(ride) {
                        Some((kind, listener.clone()))
                    } else if before.is_some_and(|b| filter.matches(b)) {
                        Some((ChangeKind::Removed, listener.clone()))
                    } else {
                        None
                    }
                })
                .collect(),
            Err(_) => return,
        };
        for (kind, listener) in listeners {
            listener(&RideChange {
                kind,
                ride: ride.clone(),
            });
        }
    }
}

impl RideStore for InMemoryStore {
    fn upsert_ride(&self, ride: &RideRequest) -> Result<(), StoreError> {
        let previous = {
            let mut inner = self.lock()?;
            inner.rides.insert(ride.id, ride.clone())
        };
        let kind = match previous {
            Some(_) => ChangeKind::Updated,
            None => ChangeKind::Inserted,
        };
        self.notify(previous.as_ref(), kind, ride);
        Ok(())
    }

    fn ride(&self, id: RideId) -> Result<RideRequest, StoreError> {
        self.lock()?
            .rides
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn rides_with_status(&self, status: RideStatus) -> Result<Vec<RideRequest>, StoreError> {
        Ok(self
            .lock()?
            .rides
            .values()
            .filter(|ride| ride.status == status)
            .cloned()
            .collect())
    }

    fn active_ride_for(&self, rider: &RiderId) -> Result<Option<RideRequest>, StoreError> {
        Ok(self
            .lock()?
            .rides
            .values()
            .find(|ride| ride.rider_id == *rider && ride.status.is_active())
            .cloned())
    }

    fn compare_and_update(
        &self,
        id: RideId,
        expected: RideStatus,
        update: RideUpdate,
    ) -> Result<RideRequest, StoreError> {
        let (before, updated) = {
            let mut inner = self.lock()?;
            let ride = inner.rides.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if ride.status != expected {
                return Err(StoreError::Conflict {
                    actual: ride.status,
                });
            }
            let before = ride.clone();
            update.apply(ride);
            (before, ride.clone())
        };
        debug!(ride_id = %updated.id, status = %updated.status, "conditional update applied");
        self.notify(Some(&before), ChangeKind::Updated, &updated);
        Ok(updated)
    }

    fn credit_driver(
        &self,
        driver: &DriverId,
        split: &CommissionSplit,
    ) -> Result<DriverStats, StoreError> {
        let mut inner = self.lock()?;
        let stats = inner.stats.entry(driver.clone()).or_default();
        stats.today_earnings += split.driver_earnings;
        stats.total_earnings += split.driver_earnings;
        stats.today_rides += 1;
        stats.total_rides += 1;
        Ok(stats.clone())
    }

    fn driver_stats(&self, driver: &DriverId) -> Result<DriverStats, StoreError> {
        Ok(self.lock()?.stats.get(driver).cloned().unwrap_or_default())
    }

    fn upsert_availability(&self, availability: &DriverAvailability) -> Result<(), StoreError> {
        self.lock()?
            .availability
            .insert(availability.driver_id.clone(), availability.clone());
        Ok(())
    }

    fn availability(&self, driver: &DriverId) -> Result<Option<DriverAvailability>, StoreError> {
        Ok(self.lock()?.availability.get(driver).cloned())
    }

    fn online_drivers(&self) -> Result<Vec<DriverAvailability>, StoreError> {
        Ok(self
            .lock()?
            .availability
            .values()
            .filter(|a| a.is_online)
            .cloned()
            .collect())
    }

    fn subscribe(
        &self,
        filter: RideFilter,
        listener: RideListener,
    ) -> Result<SubscriptionId, StoreError> {
        let mut inner = self.lock()?;
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner.subscribers.insert(id, (filter, listener));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.remove(&id);
        }
    }
}
