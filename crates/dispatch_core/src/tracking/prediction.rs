//! Linear dead-reckoning from the movement history.

use crate::geo::{bearing_deg, destination, haversine_m, FixSource, Position};

/// Extrapolate a position from the last two accepted fixes, assuming constant
/// velocity since `last`.
///
/// Speed and heading come from the last fix when reported, otherwise they are
/// derived from the two fixes. The accuracy radius is inflated to signal
/// reduced confidence. Returns `None` when the two fixes carry no usable
/// motion (zero or negative time delta).
pub fn dead_reckon(
    prev: &Position,
    last: &Position,
    now_ms: u64,
    accuracy_inflation: f64,
) -> Option<Position> {
    let dt_ms = last.timestamp.saturating_sub(prev.timestamp);
    if dt_ms == 0 {
        return None;
    }

    let speed_mps = match last.speed {
        Some(speed) if speed.is_finite() && speed >= 0.0 => speed,
        _ => haversine_m(prev, last) / (dt_ms as f64 / 1000.0),
    };
    let heading = match last.heading {
        Some(heading) if heading.is_finite() => heading,
        _ => bearing_deg(prev, last),
    };

    let elapsed_s = now_ms.saturating_sub(last.timestamp) as f64 / 1000.0;
    let travelled_km = speed_mps * elapsed_s / 1000.0;
    let (latitude, longitude) = destination(last, heading, travelled_km);

    Some(Position {
        latitude,
        longitude,
        accuracy: last.accuracy * accuracy_inflation,
        heading: Some(heading),
        speed: Some(speed_mps),
        timestamp: now_ms,
        source: FixSource::Predicted,
    })
}
