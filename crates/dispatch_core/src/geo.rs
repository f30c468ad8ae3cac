//! Geodesic operations: Haversine distances, bearings and the distance cache.
//!
//! This module provides:
//!
//! - **Position**: an immutable GPS fix value
//! - **Haversine distance** between two positions, with a road correction
//!   factor to approximate driving distance from straight-line distance
//! - **GeoDistanceEngine**: validated distance queries behind a bounded,
//!   insertion-ordered result cache
//! - **Forward geodesic**: destination point from origin, bearing and
//!   distance (used by dead-reckoning)
//!
//! No actual road geometry is computed anywhere here; the correction factor
//! is a deliberate stand-in for routing.

use std::sync::Mutex;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.071;

/// Kilometers → miles conversion factor.
pub const KM_TO_MILES: f64 = 0.621371;

/// Default multiplier applied to straight-line distance to approximate
/// road distance. Must stay within [1.2, 1.3].
pub const DEFAULT_ROAD_FACTOR: f64 = 1.2;

/// Cache bound: entries beyond this trigger a batch eviction.
pub const CACHE_CAPACITY: usize = 1000;

/// Number of oldest entries dropped in one eviction pass.
pub const CACHE_EVICT_BATCH: usize = 200;

/// Whether a position came from the hardware or from dead-reckoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixSource {
    Measured,
    Predicted,
}

/// An immutable position fix. A new reading always replaces, never mutates,
/// the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
    /// Heading in degrees clockwise from true north, when reported.
    pub heading: Option<f64>,
    /// Ground speed in meters per second, when reported.
    pub speed: Option<f64>,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub source: FixSource,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp: u64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: 0.0,
            heading: None,
            speed: None,
            timestamp,
            source: FixSource::Measured,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
}

fn validate(p: &Position) -> Result<(), GeoError> {
    if p.is_valid() {
        Ok(())
    } else {
        Err(GeoError::InvalidCoordinate {
            lat: p.latitude,
            lng: p.longitude,
        })
    }
}

/// Straight-line (great-circle) distance in kilometers. No road correction.
pub fn haversine_km(a: &Position, b: &Position) -> f64 {
    let (lat1, lon1) = (a.latitude.to_radians(), a.longitude.to_radians());
    let (lat2, lon2) = (b.latitude.to_radians(), b.longitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Straight-line distance in meters.
pub fn haversine_m(a: &Position, b: &Position) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Initial bearing from `a` to `b`, degrees clockwise from north in [0, 360).
pub fn bearing_deg(a: &Position, b: &Position) -> f64 {
    let (lat1, lon1) = (a.latitude.to_radians(), a.longitude.to_radians());
    let (lat2, lon2) = (b.latitude.to_radians(), b.longitude.to_radians());
    let dlon = lon2 - lon1;
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Forward geodesic: the point reached from `origin` after travelling
/// `distance_km` on the given initial bearing. Returns `(latitude, longitude)`.
pub fn destination(origin: &Position, bearing: f64, distance_km: f64) -> (f64, f64) {
    let delta = distance_km / EARTH_RADIUS_KM;
    let theta = bearing.to_radians();
    let lat1 = origin.latitude.to_radians();
    let lon1 = origin.longitude.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    let lon2 = (lon2.to_degrees() + 540.0) % 360.0 - 180.0;
    (lat2.to_degrees(), lon2)
}

/// Kilometers → miles.
pub fn km_to_miles(km: f64) -> f64 {
    km * KM_TO_MILES
}

/// Display unit for formatted distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceUnit {
    #[default]
    Kilometers,
    Miles,
}

impl DistanceUnit {
    pub fn label(&self) -> &'static str {
        match self {
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
        }
    }
}

/// Format a kilometer distance in the requested unit, one decimal place.
pub fn format_distance(km: f64, unit: DistanceUnit) -> String {
    let value = match unit {
        DistanceUnit::Kilometers => km,
        DistanceUnit::Miles => km_to_miles(km),
    };
    format!("{value:.1} {}", unit.label())
}

/// Configuration for the distance engine.
#[derive(Debug, Clone, Copy)]
pub struct GeoEngineConfig {
    /// Straight-line → road distance multiplier, clamped to [1.2, 1.3].
    pub road_factor: f64,
    pub cache_capacity: usize,
    pub evict_batch: usize,
}

impl Default for GeoEngineConfig {
    fn default() -> Self {
        Self {
            road_factor: DEFAULT_ROAD_FACTOR,
            cache_capacity: CACHE_CAPACITY,
            evict_batch: CACHE_EVICT_BATCH,
        }
    }
}

impl GeoEngineConfig {
    pub fn with_road_factor(mut self, factor: f64) -> Self {
        self.road_factor = factor.clamp(1.2, 1.3);
        self
    }
}

/// Coordinates quantized to 6 decimal places (~0.1 m), endpoint order
/// normalized so A→B and B→A share a cache entry.
type CacheKey = ((i64, i64), (i64, i64));

fn quantize(p: &Position) -> (i64, i64) {
    (
        (p.latitude * 1e6).round() as i64,
        (p.longitude * 1e6).round() as i64,
    )
}

fn cache_key(a: &Position, b: &Position) -> CacheKey {
    let qa = quantize(a);
    let qb = quantize(b);
    if qa <= qb {
        (qa, qb)
    } else {
        (qb, qa)
    }
}

/// Validated geodesic distance queries with a bounded result cache.
///
/// The cache is insertion-ordered and evicts the oldest [`CACHE_EVICT_BATCH`]
/// entries in one pass once it grows past [`CACHE_CAPACITY`] (batch FIFO, not
/// LRU). Disabling the cache never changes the numeric result, only the
/// computation path.
#[derive(Debug)]
pub struct GeoDistanceEngine {
    config: GeoEngineConfig,
    cache: Mutex<IndexMap<CacheKey, f64>>,
}

impl Default for GeoDistanceEngine {
    fn default() -> Self {
        Self::new(GeoEngineConfig::default())
    }
}

impl GeoDistanceEngine {
    pub fn new(config: GeoEngineConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(IndexMap::new()),
        }
    }

    pub fn config(&self) -> &GeoEngineConfig {
        &self.config
    }

    /// Estimated road distance between two positions in kilometers.
    ///
    /// Haversine straight-line distance times the road correction factor.
    /// Non-finite or out-of-range coordinates are a hard error, never a
    /// silent zero.
    pub fn distance_km(&self, a: &Position, b: &Position, use_cache: bool) -> Result<f64, GeoError> {
        validate(a)?;
        validate(b)?;

        if !use_cache {
            return Ok(self.compute(a, b));
        }

        let key = cache_key(a, b);
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            // Fallback: compute without cache if mutex poisoned
            Err(_) => return Ok(self.compute(a, b)),
        };

        if let Some(km) = cache.get(&key) {
            return Ok(*km);
        }

        let km = self.compute(a, b);
        cache.insert(key, km);
        if cache.len() > self.config.cache_capacity {
            let batch = self.config.evict_batch.min(cache.len());
            cache.drain(0..batch);
            debug!(evicted = batch, remaining = cache.len(), "distance cache eviction");
        }
        Ok(km)
    }

    fn compute(&self, a: &Position, b: &Position) -> f64 {
        haversine_km(a, b) * self.config.road_factor
    }

    /// Number of cached distance results.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether the pair is currently cached (order-insensitive).
    pub fn cache_contains(&self, a: &Position, b: &Position) -> bool {
        self.cache
            .lock()
            .map(|c| c.contains_key(&cache_key(a, b)))
            .unwrap_or(false)
    }
}
