//! Ride records and the lifecycle state machine.
//!
//! Status only moves forward (`pending → accepted → in_progress →
//! completed`) or into the single terminal `cancelled` state, reachable from
//! `pending` and `accepted` only. `completed` and `cancelled` have no
//! outgoing transitions. Every (state, action) pair not listed here is
//! rejected with [`LifecycleError::InvalidTransition`].

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::geo::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(pub Uuid);

impl RideId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RideId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiderId(pub String);

impl fmt::Display for RiderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RiderId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub String);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DriverId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ALL: [RideStatus; 5] = [
        RideStatus::Pending,
        RideStatus::Accepted,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Pending, accepted or in-progress.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RideStatus::Pending => "pending",
            RideStatus::Accepted => "accepted",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Collected,
    Refunded,
}

/// The trip record; the wire format shared with the UI layer.
///
/// `distance_km` and `fare` are computed once at request time and frozen;
/// completion writes a separate `final_fare`, never an in-place rewrite of
/// the original estimate. At most one non-null `driver_id` for the lifetime
/// of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub id: RideId,
    pub rider_id: RiderId,
    pub pickup: Position,
    pub drop: Position,
    pub pickup_address: String,
    pub drop_address: String,
    pub distance_km: f64,
    pub estimated_minutes: u32,
    pub fare: Decimal,
    pub final_fare: Option<Decimal>,
    pub status: RideStatus,
    pub driver_id: Option<DriverId>,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub created_at: u64,
    pub accepted_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub cancelled_at: Option<u64>,
    pub cancel_reason: Option<String>,
}

/// Aggregate per-driver earnings counters, updated atomically on completion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStats {
    pub today_earnings: Decimal,
    pub total_earnings: Decimal,
    pub today_rides: u32,
    pub total_rides: u32,
}

/// The actor requesting a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Rider(RiderId),
    Driver(DriverId),
}

/// A requested lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RideAction {
    Accept { driver: DriverId },
    Start { driver: DriverId },
    Complete { driver: DriverId },
    Cancel { actor: Actor, reason: String },
}

impl RideAction {
    pub fn name(&self) -> &'static str {
        match self {
            RideAction::Accept { .. } => "accept",
            RideAction::Start { .. } => "start",
            RideAction::Complete { .. } => "complete",
            RideAction::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    /// Lost the accept race. An expected outcome, not a system fault.
    #[error("ride is already assigned to another driver")]
    AlreadyAssigned,
    /// The lifecycle graph does not define this (state, action) pair.
    #[error("cannot {action} a ride in status {from}")]
    InvalidTransition {
        from: RideStatus,
        action: &'static str,
    },
    /// The caller is not the actor the current state authorizes.
    #[error("caller is not authorized to {action} this ride")]
    NotAuthorized { action: &'static str },
}

/// Validate a transition against the lifecycle graph and its guards.
///
/// Returns the target status on success. This is the pure guard check; the
/// authoritative arbitration under races is the store's compare-and-swap,
/// which the dispatch layer conditions on the status observed here.
pub fn check_transition(ride: &RideRequest, action: &RideAction) -> Result<RideStatus, LifecycleError> {
    let invalid = || LifecycleError::InvalidTransition {
        from: ride.status,
        action: action.name(),
    };

    match action {
        RideAction::Accept { .. } => match ride.status {
            RideStatus::Pending if ride.driver_id.is_none() => Ok(RideStatus::Accepted),
            RideStatus::Pending | RideStatus::Accepted | RideStatus::InProgress => {
                Err(LifecycleError::AlreadyAssigned)
            }
            RideStatus::Completed | RideStatus::Cancelled => Err(invalid()),
        },
        RideAction::Start { driver } => match ride.status {
            RideStatus::Accepted => {
                if ride.driver_id.as_ref() == Some(driver) {
                    Ok(RideStatus::InProgress)
                } else {
                    Err(LifecycleError::NotAuthorized {
                        action: action.name(),
                    })
                }
            }
            _ => Err(invalid()),
        },
        RideAction::Complete { driver } => match ride.status {
            RideStatus::InProgress => {
                if ride.driver_id.as_ref() == Some(driver) {
                    Ok(RideStatus::Completed)
                } else {
                    Err(LifecycleError::NotAuthorized {
                        action: action.name(),
                    })
                }
            }
            _ => Err(invalid()),
        },
        RideAction::Cancel { actor, .. } => match ride.status {
            RideStatus::Pending | RideStatus::Accepted => {
                let authorized = match actor {
                    Actor::Rider(rider) => *rider == ride.rider_id,
                    Actor::Driver(driver) => ride.driver_id.as_ref() == Some(driver),
                };
                if authorized {
                    Ok(RideStatus::Cancelled)
                } else {
                    Err(LifecycleError::NotAuthorized {
                        action: action.name(),
                    })
                }
            }
            _ => Err(invalid()),
        },
    }
}
