//! Coin selection with fee convergence
//!
//! Smallest outputs are spent first. The fee depends on the input count and
//! the input count depends on the fee, so selection repeats with
//! `target = total_send + fee` until the selected amount covers both.

use log::debug;

use super::error::WalletError;
use super::utxo::UnspentOutput;
use crate::core::fee::{estimate_fee, FeeRate};

/// Default cap on inputs per transaction
pub const DEFAULT_MAX_INPUTS: usize = 100;

/// Selection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionParams {
    pub fee_rate: FeeRate,
    /// Reject selections above this many inputs
    pub max_inputs: usize,
    /// Outputs added besides destinations and change (e.g. contract calls)
    pub extra_outputs: usize,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            fee_rate: FeeRate::default(),
            max_inputs: DEFAULT_MAX_INPUTS,
            extra_outputs: 0,
        }
    }
}

/// Result of coin selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Selected outputs, ascending by amount
    pub selected: Vec<UnspentOutput>,
    pub total_in: u64,
    pub total_send: u64,
    pub fee: u64,
    /// `total_in - total_send - fee`; no change output when zero
    pub change: u64,
}

/// Select spendable outputs covering `total_send` plus the fee for a
/// transaction with `destination_count` payments and one change output.
pub fn select_utxos(
    utxos: &[UnspentOutput],
    total_send: u64,
    destination_count: usize,
    params: &SelectionParams,
) -> Result<Selection, WalletError> {
    let mut candidates: Vec<&UnspentOutput> = utxos.iter().filter(|u| u.spendable).collect();
    candidates.sort_by_key(|u| u.amount);
    let available = WalletError::checked_total(candidates.iter().map(|u| u.amount))?;
    let output_count = destination_count + params.extra_outputs + 1;

    let mut target = total_send;
    let mut rounds = 0usize;
    let (count, total_in, fee) = loop {
        rounds += 1;
        if available < target {
            return Err(WalletError::InsufficientFunds {
                have: available,
                need: target,
            });
        }

        let mut count = 0;
        let mut sum = 0u64;
        for utxo in &candidates {
            if sum >= target && count > 0 {
                break;
            }
            // bounded by `available`
            sum += utxo.amount;
            count += 1;
        }

        let fee = estimate_fee(count, output_count, params.fee_rate);
        let needed = total_send.saturating_add(fee);
        if needed > sum {
            // target strictly grows, so every round selects at least one more input
            target = needed;
            continue;
        }
        break (count, sum, fee);
    };

    if count > params.max_inputs {
        return Err(WalletError::TooManyInputs {
            selected: count,
            max: params.max_inputs,
        });
    }

    debug!(
        "Selected {} inputs ({} units) for {} + fee {} after {} round(s)",
        count, total_in, total_send, fee, rounds
    );

    Ok(Selection {
        selected: candidates[..count].iter().map(|u| (*u).clone()).collect(),
        total_in,
        total_send,
        fee,
        change: total_in - total_send - fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amount::to_base_units;
    use crate::core::transaction::Txid;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn utxo(seed: u8, amount: u64) -> UnspentOutput {
        UnspentOutput::new(Txid([seed; 32]), 0, &format!("addr{}", seed), &[0x51], amount)
    }

    fn coins(s: &str) -> u64 {
        to_base_units(Decimal::from_str(s).unwrap(), 8).unwrap()
    }

    #[test]
    fn test_worked_example() {
        let utxos = vec![utxo(1, coins("0.10")), utxo(2, coins("0.097"))];
        let params = SelectionParams {
            fee_rate: FeeRate::from_coin_per_byte(Decimal::from_str("0.0001").unwrap(), 8).unwrap(),
            ..Default::default()
        };
        let selection = select_utxos(&utxos, coins("0.15"), 1, &params).unwrap();

        assert_eq!(selection.selected.len(), 2);
        assert_eq!(selection.selected[0].amount, coins("0.097"));
        // 10 + 2 * 148 + 2 * 34 = 374 bytes at 10_000 units/byte
        assert_eq!(selection.fee, 3_740_000);
        assert_eq!(selection.change, coins("0.197") - coins("0.15") - 3_740_000);
        assert!(selection.change > 0);
    }

    #[test]
    fn test_fee_pulls_in_extra_input() {
        // 1000 alone covers the send but not the fee
        let utxos = vec![utxo(1, 1_000), utxo(2, 1_000), utxo(3, 5_000)];
        let params = SelectionParams {
            fee_rate: FeeRate(1),
            ..Default::default()
        };
        let selection = select_utxos(&utxos, 900, 1, &params).unwrap();
        assert_eq!(selection.selected.len(), 2);
        assert!(selection.total_in >= selection.total_send + selection.fee);
        assert_eq!(selection.fee, estimate_fee(2, 2, FeeRate(1)));
    }

    #[test]
    fn test_exact_cover_has_no_change() {
        let fee = estimate_fee(1, 2, FeeRate(2));
        let utxos = vec![utxo(1, 10_000 + fee)];
        let params = SelectionParams {
            fee_rate: FeeRate(2),
            ..Default::default()
        };
        let selection = select_utxos(&utxos, 10_000, 1, &params).unwrap();
        assert_eq!(selection.change, 0);
    }

    #[test]
    fn test_insufficient_funds() {
        let utxos = vec![utxo(1, 500), utxo(2, 400)];
        let err = select_utxos(&utxos, 1_000, 1, &SelectionParams::default()).unwrap_err();
        assert!(matches!(
            err,
            WalletError::InsufficientFunds { have: 900, need: 1_000 }
        ));

        // enough for the send, not for the fee
        let params = SelectionParams {
            fee_rate: FeeRate(10),
            ..Default::default()
        };
        assert!(matches!(
            select_utxos(&utxos, 800, 1, &params),
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_overflowing_total_rejected() {
        let utxos = vec![utxo(1, u64::MAX), utxo(2, 1)];
        assert!(matches!(
            select_utxos(&utxos, 1_000, 1, &SelectionParams::default()),
            Err(WalletError::AmountOverflow)
        ));
    }

    #[test]
    fn test_unspendable_ignored() {
        let mut locked = utxo(1, 1_000_000);
        locked.spendable = false;
        let utxos = vec![locked, utxo(2, 100)];
        assert!(matches!(
            select_utxos(&utxos, 50_000, 1, &SelectionParams::default()),
            Err(WalletError::InsufficientFunds { have: 100, .. })
        ));
    }

    #[test]
    fn test_max_inputs() {
        let utxos: Vec<_> = (0..10).map(|i| utxo(i, 1_000)).collect();
        let params = SelectionParams {
            fee_rate: FeeRate(0),
            max_inputs: 3,
            extra_outputs: 0,
        };
        assert!(matches!(
            select_utxos(&utxos, 5_000, 1, &params),
            Err(WalletError::TooManyInputs { selected: 5, max: 3 })
        ));
    }

    #[test]
    fn test_converges_on_many_small_outputs() {
        let utxos: Vec<_> = (0..200).map(|i| utxo(i as u8, 200 + i)).collect();
        let params = SelectionParams {
            fee_rate: FeeRate(1),
            max_inputs: 500,
            extra_outputs: 1,
        };
        let selection = select_utxos(&utxos, 2_000, 2, &params).unwrap();
        assert!(selection.total_in >= selection.total_send + selection.fee);
        assert_eq!(
            selection.fee,
            estimate_fee(selection.selected.len(), 4, FeeRate(1))
        );
    }

    #[test]
    fn test_zero_send_still_pays_fee() {
        let utxos = vec![utxo(1, 10_000)];
        let selection = select_utxos(&utxos, 0, 1, &SelectionParams::default()).unwrap();
        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.total_in, 10_000);
    }
}
