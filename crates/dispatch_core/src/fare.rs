//! Fare estimation and the platform/driver commission split.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base fare in currency units.
pub const DEFAULT_BASE_FARE: Decimal = dec!(2.50);

/// Per-kilometer rate in currency units.
pub const DEFAULT_PER_KM_RATE: Decimal = dec!(1.50);

/// Platform commission rate.
pub const DEFAULT_COMMISSION_RATE: Decimal = dec!(0.10);

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum FareError {
    #[error("distance must be a finite non-negative number, got {0}")]
    InvalidDistance(f64),
}

/// Tariff configuration. Exact rates are an input, not hard-coded policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareConfig {
    pub base_fare: Decimal,
    pub per_km_rate: Decimal,
    pub commission_rate: Decimal,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: DEFAULT_BASE_FARE,
            per_km_rate: DEFAULT_PER_KM_RATE,
            commission_rate: DEFAULT_COMMISSION_RATE,
        }
    }
}

impl FareConfig {
    pub fn with_tariff(mut self, base_fare: Decimal, per_km_rate: Decimal) -> Self {
        self.base_fare = base_fare;
        self.per_km_rate = per_km_rate;
        self
    }

    pub fn with_commission_rate(mut self, rate: Decimal) -> Self {
        self.commission_rate = rate;
        self
    }
}

/// Gross fare broken into the platform cut and driver earnings.
///
/// Derived, never stored as an independent source of truth: always recomputed
/// from the gross fare and the commission rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub gross_fare: Decimal,
    pub platform_cut: Decimal,
    pub driver_earnings: Decimal,
}

/// Converts distance into a fare and splits it between platform and driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct FareCalculator {
    config: FareConfig,
}

impl FareCalculator {
    pub fn new(config: FareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FareConfig {
        &self.config
    }

    /// Estimated fare for a trip distance, rounded to cents.
    ///
    /// `fare = base_fare + distance_km * per_km_rate`, monotonically
    /// increasing in distance.
    pub fn estimate(&self, distance_km: f64) -> Result<Decimal, FareError> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            return Err(FareError::InvalidDistance(distance_km));
        }
        let distance =
            Decimal::from_f64(distance_km).ok_or(FareError::InvalidDistance(distance_km))?;
        let gross = self.config.base_fare + distance * self.config.per_km_rate;
        Ok(round_cents(gross))
    }

    /// Split a gross fare between platform and driver.
    ///
    /// The platform cut is rounded half-up to cents and the remainder folds
    /// into driver earnings, so `platform_cut + driver_earnings` equals the
    /// gross fare exactly.
    pub fn split(&self, gross_fare: Decimal) -> CommissionSplit {
        let gross_fare = round_cents(gross_fare);
        let platform_cut = round_cents(gross_fare * self.config.commission_rate);
        CommissionSplit {
            gross_fare,
            platform_cut,
            driver_earnings: gross_fare - platform_cut,
        }
    }

    /// Final fare for a completed trip: re-estimate from distance, then split.
    pub fn finalize(&self, distance_km: f64) -> Result<CommissionSplit, FareError> {
        Ok(self.split(self.estimate(distance_km)?))
    }
}

fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
