//! Conversion between coin-denominated decimals and integer base units

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

/// Decimal places of a Bitcoin-like coin (1 coin = 10^8 base units)
pub const DEFAULT_DECIMALS: u32 = 8;

/// Amount conversion errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmountError {
    #[error("Negative amount: {0}")]
    Negative(Decimal),
    #[error("Amount {amount} has more than {decimals} decimal places")]
    TooPrecise { amount: Decimal, decimals: u32 },
    #[error("Amount out of range: {0}")]
    OutOfRange(Decimal),
}

/// Convert a coin amount (e.g. `0.097`) to base units
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u64, AmountError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AmountError::Negative(amount));
    }
    let scale = Decimal::from(10u64.pow(decimals));
    let scaled = amount
        .checked_mul(scale)
        .ok_or(AmountError::OutOfRange(amount))?;
    if scaled.fract() != Decimal::ZERO {
        return Err(AmountError::TooPrecise { amount, decimals });
    }
    scaled.to_u64().ok_or(AmountError::OutOfRange(amount))
}

/// Convert base units back to a coin amount
pub fn from_base_units(units: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(units as i128, decimals).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_round_trip() {
        let amount = Decimal::from_str("0.097").unwrap();
        let units = to_base_units(amount, DEFAULT_DECIMALS).unwrap();
        assert_eq!(units, 9_700_000);
        assert_eq!(from_base_units(units, DEFAULT_DECIMALS), amount);
    }

    #[test]
    fn test_whole_coins() {
        assert_eq!(to_base_units(Decimal::from(21), 8).unwrap(), 2_100_000_000);
        assert_eq!(from_base_units(100_000_000, 8), Decimal::ONE);
    }

    #[test]
    fn test_rejects_negative_and_dust_precision() {
        assert!(matches!(
            to_base_units(Decimal::from_str("-1").unwrap(), 8),
            Err(AmountError::Negative(_))
        ));
        assert!(matches!(
            to_base_units(Decimal::from_str("0.000000001").unwrap(), 8),
            Err(AmountError::TooPrecise { .. })
        ));
    }
}
