//! Wallet manager: build, sign, verify and broadcast transfers
//!
//! One engine serves every Bitcoin-like chain. Address formats come from
//! [`AddressConfig`]; per-chain transaction differences come from a
//! [`ChainQuirks`] implementation.

use std::sync::Arc;

use log::{info, warn};

use super::error::WalletError;
use super::selector::{select_utxos, Selection, SelectionParams};
use super::signer::{sign_transaction, verify_transaction, UnlockDescriptor};
use super::utxo::{Destination, UnspentOutput};
use crate::config::{ChainConfig, WalletConfig};
use crate::core::address::{lock_script_for, AddressConfig};
use crate::core::fee::FeeRate;
use crate::core::script::{encode_script_num, push_data};
use crate::core::sighash::SigHashType;
use crate::core::transaction::{sequence_for, RawTransaction, TxInput, TxOutput, Txid, TX_VERSION};
use crate::scanner::rpc::ChainRpc;

// =============================================================================
// Chain quirks
// =============================================================================

/// Per-chain transaction differences
pub trait ChainQuirks: Send + Sync {
    fn tx_version(&self) -> u32 {
        TX_VERSION
    }

    /// Whether witness outputs and spends are allowed
    fn supports_segwit(&self) -> bool {
        true
    }

    /// Outputs appended after the destinations, before change
    fn extra_outputs(&self) -> Vec<TxOutput> {
        Vec::new()
    }
}

/// Plain Bitcoin rules
#[derive(Debug, Clone, Copy, Default)]
pub struct BitcoinQuirks;

impl ChainQuirks for BitcoinQuirks {}

/// QTUM opcode for calling an existing contract
pub const OP_CALL: u8 = 0xc2;

/// QTUM contract VM version used in OP_CALL outputs
pub const QTUM_VM_VERSION: i64 = 4;

/// A contract call carried in a QTUM OP_CALL output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub contract_address: [u8; 20],
    /// ABI-encoded call data
    pub data: Vec<u8>,
    pub gas_limit: u64,
    /// Gas price in base units
    pub gas_price: u64,
    /// Value sent to the contract
    pub amount: u64,
}

impl ContractCall {
    /// `<version> <gas limit> <gas price> <data> <contract> OP_CALL`
    pub fn lock_script(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(40 + self.data.len());
        push_data(&mut script, &encode_script_num(QTUM_VM_VERSION));
        push_data(&mut script, &encode_script_num(self.gas_limit as i64));
        push_data(&mut script, &encode_script_num(self.gas_price as i64));
        push_data(&mut script, &self.data);
        push_data(&mut script, &self.contract_address);
        script.push(OP_CALL);
        script
    }
}

/// QTUM rules: optional contract-call output
#[derive(Debug, Clone, Default)]
pub struct QtumQuirks {
    pub contract_call: Option<ContractCall>,
}

impl ChainQuirks for QtumQuirks {
    fn extra_outputs(&self) -> Vec<TxOutput> {
        self.contract_call
            .iter()
            .map(|call| TxOutput::new(call.amount, call.lock_script()))
            .collect()
    }
}

// =============================================================================
// Wallet manager
// =============================================================================

/// An unsigned transfer and the outputs it spends
#[derive(Debug, Clone)]
pub struct TransferDraft {
    pub tx: RawTransaction,
    pub selection: Selection,
    /// Index of the change output, if one was added
    pub change_index: Option<usize>,
}

impl TransferDraft {
    /// Unlock descriptors without keys, in input order
    pub fn unlock_templates(&self) -> Result<Vec<UnlockDescriptor>, WalletError> {
        self.selection
            .selected
            .iter()
            .map(UnlockDescriptor::from_utxo)
            .collect()
    }
}

/// Builds, signs, verifies and broadcasts transactions for one chain
pub struct WalletManager {
    address: AddressConfig,
    wallet: WalletConfig,
    quirks: Arc<dyn ChainQuirks>,
    rpc: Arc<dyn ChainRpc>,
}

impl WalletManager {
    pub fn new(
        address: AddressConfig,
        wallet: WalletConfig,
        quirks: Arc<dyn ChainQuirks>,
        rpc: Arc<dyn ChainRpc>,
    ) -> Self {
        Self {
            address,
            wallet,
            quirks,
            rpc,
        }
    }

    pub fn from_config(config: &ChainConfig, quirks: Arc<dyn ChainQuirks>, rpc: Arc<dyn ChainRpc>) -> Self {
        Self::new(config.address.clone(), config.wallet.clone(), quirks, rpc)
    }

    /// Address parameters with segwit gated by the chain rules
    fn effective_address_config(&self) -> AddressConfig {
        let mut config = self.address.clone();
        config.segwit = config.segwit && self.quirks.supports_segwit();
        config
    }

    /// Select inputs and assemble an unsigned transfer.
    ///
    /// Change goes to `change_address`, or to the address of the first
    /// selected output, and is only added when non-zero.
    pub fn build_transfer(
        &self,
        utxos: &[UnspentOutput],
        destinations: &[Destination],
        fee_rate: FeeRate,
        change_address: Option<&str>,
    ) -> Result<TransferDraft, WalletError> {
        if destinations.is_empty() {
            return Err(WalletError::NoDestinations);
        }
        let address_config = self.effective_address_config();

        let mut outputs = Vec::with_capacity(destinations.len() + 2);
        for destination in destinations {
            if destination.amount == 0 {
                return Err(WalletError::ZeroAmount(destination.address.clone()));
            }
            let lock_script = lock_script_for(&destination.address, &address_config)?;
            outputs.push(TxOutput::new(destination.amount, lock_script));
        }
        let extra = self.quirks.extra_outputs();
        let total_send = WalletError::checked_total(outputs.iter().chain(extra.iter()).map(|o| o.amount))?;
        outputs.extend(extra.iter().cloned());

        let params = SelectionParams {
            fee_rate,
            max_inputs: self.wallet.max_inputs,
            extra_outputs: extra.len(),
        };
        let selection = select_utxos(utxos, total_send, destinations.len(), &params)?;

        let sequence = sequence_for(self.wallet.locktime, self.wallet.enable_rbf);
        let mut tx = RawTransaction::new(self.quirks.tx_version(), self.wallet.locktime);
        for utxo in &selection.selected {
            tx.inputs.push(TxInput::new(utxo.txid, utxo.vout, sequence));
        }
        tx.outputs = outputs;

        let mut change_index = None;
        if selection.change > 0 {
            let change_to = match change_address {
                Some(address) => address,
                None => selection
                    .selected
                    .first()
                    .map(|u| u.address.as_str())
                    .ok_or(WalletError::NoDestinations)?,
            };
            let lock_script = lock_script_for(change_to, &address_config)?;
            change_index = Some(tx.outputs.len());
            tx.outputs.push(TxOutput::new(selection.change, lock_script));
        }

        info!(
            "Built transfer: {} inputs, {} outputs, send {}, fee {}, change {}",
            tx.inputs.len(),
            tx.outputs.len(),
            total_send,
            selection.fee,
            selection.change
        );

        Ok(TransferDraft {
            tx,
            selection,
            change_index,
        })
    }

    /// Sign a draft; one unlock descriptor per input
    pub fn sign(&self, tx: &RawTransaction, unlocks: &[UnlockDescriptor]) -> Result<RawTransaction, WalletError> {
        sign_transaction(tx, unlocks, SigHashType::All)
    }

    pub fn verify(&self, tx: &RawTransaction, unlocks: &[UnlockDescriptor]) -> Result<(), WalletError> {
        verify_transaction(tx, unlocks)
    }

    /// Broadcast a signed transaction
    pub async fn broadcast(&self, tx: &RawTransaction) -> Result<Txid, WalletError> {
        let expected = tx.txid();
        let returned = self.rpc.send_raw_transaction(&tx.to_hex()).await?;
        match returned.parse::<Txid>() {
            Ok(txid) if txid == expected => {}
            _ => warn!("Backend returned txid {} for transaction {}", returned, expected),
        }
        info!("Broadcast transaction {}", expected);
        Ok(expected)
    }

    /// Sign, verify and broadcast
    pub async fn send(&self, draft: &TransferDraft, unlocks: &[UnlockDescriptor]) -> Result<Txid, WalletError> {
        let signed = self.sign(&draft.tx, unlocks)?;
        self.verify(&signed, unlocks)?;
        self.broadcast(&signed).await
    }

    /// Current fee rate from the backend, in base units per byte
    pub async fn fee_rate(&self) -> Result<FeeRate, WalletError> {
        let per_kb = self.rpc.estimate_fee_rate().await?;
        Ok(FeeRate::from_coin_per_kb(per_kb, self.wallet.decimals)?)
    }

    pub fn address_config(&self) -> &AddressConfig {
        &self.address
    }
}
