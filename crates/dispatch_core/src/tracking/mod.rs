//! Per-device location tracking.
//!
//! The tracker wraps an external position source, degrades its accuracy tier
//! after timeouts, suppresses GPS jitter below a movement threshold, keeps a
//! short history of accepted fixes and falls back to linear dead-reckoning
//! when no live fix can be obtained.
//!
//! The tracker is pull-driven: a ticker (or test) calls [`LocationTracker::poll`]
//! and listeners receive the resulting fixes and errors. Fixes reach
//! listeners in monotonically non-decreasing timestamp order.

pub mod prediction;
pub mod tiers;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::geo::{haversine_m, FixSource, Position};
use crate::pubsub::{Listener, Subscribers, SubscriptionId};

pub use tiers::{AccuracyTier, FixOptions};

/// Movement threshold: fixes closer than this to the last reported fix are
/// forwarded but not recorded as movement.
pub const JITTER_THRESHOLD_M: f64 = 10.0;

/// Accepted fixes kept for dead-reckoning, FIFO.
pub const HISTORY_LEN: usize = 10;

/// Accuracy radius multiplier for predicted positions.
pub const PREDICTION_ACCURACY_INFLATION: f64 = 1.5;

/// A raw reading from the external geolocation facility.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: u64,
}

/// Typed errors from the position source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("position permission denied")]
    PermissionDenied,
    #[error("position acquisition timed out")]
    Timeout,
    #[error("position source unavailable: {0}")]
    Unavailable(String),
}

/// The external geolocation facility, one acquisition per call.
pub trait PositionSource: Send {
    fn fetch(&mut self, options: &FixOptions) -> Result<RawFix, PositionError>;

    /// Abort any in-flight acquisition. Called when tracking stops.
    fn cancel(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    /// Permission denied or hardware absent. Terminal for the session.
    #[error("location unavailable for this session")]
    LocationUnavailable,
    /// Acquisition timed out with no tier left to degrade to.
    #[error("position acquisition timed out in the lowest accuracy tier")]
    Timeout,
    /// Transient source failure; tracking continues at the current tier.
    #[error("position source error: {0}")]
    Source(String),
    #[error("tracker is not running")]
    NotTracking,
}

/// What listeners receive.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Fix(Position),
    Error(TrackingError),
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub jitter_threshold_m: f64,
    pub history_len: usize,
    pub prediction_enabled: bool,
    pub accuracy_inflation: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            jitter_threshold_m: JITTER_THRESHOLD_M,
            history_len: HISTORY_LEN,
            prediction_enabled: true,
            accuracy_inflation: PREDICTION_ACCURACY_INFLATION,
        }
    }
}

impl TrackerConfig {
    pub fn with_prediction(mut self, enabled: bool) -> Self {
        self.prediction_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Idle,
    Tracking,
}

/// Position acquisition for one device.
pub struct LocationTracker {
    source: Box<dyn PositionSource>,
    clock: SharedClock,
    config: TrackerConfig,
    state: TrackerState,
    tier: AccuracyTier,
    /// Accepted (non-suppressed) measured fixes, oldest first.
    history: Vec<Position>,
    last_reported: Option<Position>,
    last_emitted_ts: u64,
    listeners: Subscribers<TrackerEvent>,
}

impl std::fmt::Debug for LocationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationTracker")
            .field("state", &self.state)
            .field("tier", &self.tier)
            .field("history", &self.history.len())
            .finish()
    }
}

impl LocationTracker {
    pub fn new(source: Box<dyn PositionSource>, clock: SharedClock) -> Self {
        Self::with_config(source, clock, TrackerConfig::default())
    }

    pub fn with_config(
        source: Box<dyn PositionSource>,
        clock: SharedClock,
        config: TrackerConfig,
    ) -> Self {
        Self {
            source,
            clock,
            config,
            state: TrackerState::Idle,
            tier: AccuracyTier::High,
            history: Vec::new(),
            last_reported: None,
            last_emitted_ts: 0,
            listeners: Subscribers::new(),
        }
    }

    /// Begin a tracking session in the `High` tier.
    pub fn start(&mut self) {
        if self.state == TrackerState::Tracking {
            return;
        }
        self.state = TrackerState::Tracking;
        self.tier = AccuracyTier::High;
        self.history.clear();
        self.last_reported = None;
    }

    /// Halt the session: cancel the source and drop all listeners.
    pub fn stop(&mut self) {
        self.source.cancel();
        self.state = TrackerState::Idle;
        self.listeners.clear();
        self.history.clear();
        self.last_reported = None;
    }

    pub fn is_tracking(&self) -> bool {
        self.state == TrackerState::Tracking
    }

    pub fn tier(&self) -> AccuracyTier {
        self.tier
    }

    pub fn history(&self) -> &[Position] {
        &self.history
    }

    pub fn last_reported(&self) -> Option<&Position> {
        self.last_reported.as_ref()
    }

    pub fn subscribe(&self, listener: Listener<TrackerEvent>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id)
    }

    /// Acquire one fix with the current tier's options.
    ///
    /// Returns the position delivered to listeners, if any. Timeouts degrade
    /// the tier and surface as an error only once the lowest tier is
    /// exhausted; permission denial stops the session. When a live fix fails
    /// and prediction is possible, a dead-reckoned position is delivered
    /// instead.
    pub fn poll(&mut self) -> Result<Option<Position>, TrackingError> {
        if self.state != TrackerState::Tracking {
            return Err(TrackingError::NotTracking);
        }

        let options = self.tier.options();
        match self.source.fetch(&options) {
            Ok(fix) => Ok(self.accept_fix(fix)),
            Err(PositionError::PermissionDenied) => {
                let err = TrackingError::LocationUnavailable;
                self.listeners.emit(&TrackerEvent::Error(err.clone()));
                self.stop();
                Err(err)
            }
            Err(PositionError::Timeout) => {
                let exhausted = match self.tier.degraded() {
                    Some(next) => {
                        warn!(from = ?self.tier, to = ?next, "position timeout, degrading tier");
                        self.tier = next;
                        false
                    }
                    None => true,
                };
                if let Some(predicted) = self.predict() {
                    return Ok(Some(predicted));
                }
                if exhausted {
                    self.listeners
                        .emit(&TrackerEvent::Error(TrackingError::Timeout));
                }
                Ok(None)
            }
            Err(PositionError::Unavailable(msg)) => {
                if let Some(predicted) = self.predict() {
                    return Ok(Some(predicted));
                }
                self.listeners
                    .emit(&TrackerEvent::Error(TrackingError::Source(msg)));
                Ok(None)
            }
        }
    }

    fn accept_fix(&mut self, fix: RawFix) -> Option<Position> {
        let mut position = Position {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            heading: fix.heading,
            speed: fix.speed,
            timestamp: fix.timestamp.max(self.last_emitted_ts),
            source: FixSource::Measured,
        };
        if !position.is_valid() {
            self.listeners.emit(&TrackerEvent::Error(TrackingError::Source(
                "non-finite coordinates in fix".to_owned(),
            )));
            return None;
        }

        let moved = match &self.last_reported {
            Some(last) => haversine_m(last, &position) >= self.config.jitter_threshold_m,
            None => true,
        };

        if moved {
            self.history.push(position);
            if self.history.len() > self.config.history_len {
                self.history.remove(0);
            }
        } else {
            // Jitter: forward with a refreshed timestamp, but keep it out of
            // the movement history.
            position.timestamp = self.clock.now_ms().max(self.last_emitted_ts);
            debug!("suppressed sub-threshold movement");
        }

        self.last_reported = Some(position);
        self.last_emitted_ts = position.timestamp;
        self.listeners.emit(&TrackerEvent::Fix(position));
        Some(position)
    }

    fn predict(&mut self) -> Option<Position> {
        if !self.config.prediction_enabled || self.history.len() < 2 {
            return None;
        }
        let prev = self.history[self.history.len() - 2];
        let last = self.history[self.history.len() - 1];
        let now = self.clock.now_ms();
        let mut predicted =
            prediction::dead_reckon(&prev, &last, now, self.config.accuracy_inflation)?;
        predicted.timestamp = predicted.timestamp.max(self.last_emitted_ts);
        self.last_emitted_ts = predicted.timestamp;
        // Predicted positions are never written back into history.
        self.listeners.emit(&TrackerEvent::Fix(predicted));
        Some(predicted)
    }
}
