//! Fee rates and transaction size estimation
//!
//! Fees are computed from an estimated serialized size rather than the real
//! one, so coin selection can run before any signature exists.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::amount::{to_base_units, AmountError};

// =============================================================================
// Constants
// =============================================================================

/// Version, locktime and the two count prefixes
pub const TX_OVERHEAD_BYTES: u64 = 10;

/// Signed P2PKH input: outpoint, sequence, scriptSig with DER sig + pubkey
pub const INPUT_BYTES: u64 = 148;

/// Output with a 25-byte lock script and its amount
pub const OUTPUT_BYTES: u64 = 34;

/// Default minimum fee rate (base units per byte)
pub const MIN_FEE_RATE: u64 = 1;

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in base units per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create from base units per byte
    pub fn from_sat_per_byte(rate: u64) -> Self {
        Self(rate)
    }

    /// Create from a coin-denominated per-byte rate such as `0.0001`
    pub fn from_coin_per_byte(rate: Decimal, decimals: u32) -> Result<Self, AmountError> {
        Ok(Self(to_base_units(rate, decimals)?))
    }

    /// Create from a coin-denominated per-kilobyte rate (node `estimatesmartfee` style).
    ///
    /// Rounds up so the resulting rate never undershoots the estimate.
    pub fn from_coin_per_kb(rate: Decimal, decimals: u32) -> Result<Self, AmountError> {
        let per_kb = to_base_units(rate, decimals)?;
        Ok(Self(per_kb.div_ceil(1000).max(MIN_FEE_RATE)))
    }

    /// Calculate fee for a given size
    pub fn fee_for_size(&self, size_bytes: u64) -> u64 {
        self.0.saturating_mul(size_bytes)
    }

    /// Get rate as base units per byte
    pub fn as_sat_per_byte(&self) -> u64 {
        self.0
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(MIN_FEE_RATE)
    }
}

// =============================================================================
// Size Estimation
// =============================================================================

/// Estimated serialized size of a signed transaction
pub fn estimate_size(input_count: usize, output_count: usize) -> u64 {
    TX_OVERHEAD_BYTES + input_count as u64 * INPUT_BYTES + output_count as u64 * OUTPUT_BYTES
}

/// Estimated fee for a transaction of the given shape
pub fn estimate_fee(input_count: usize, output_count: usize, rate: FeeRate) -> u64 {
    rate.fee_for_size(estimate_size(input_count, output_count))
}

// =============================================================================
// Tests
// =============================================================================
