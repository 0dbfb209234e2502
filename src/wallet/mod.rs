//! Wallet: input selection, signing and the per-chain transfer manager

pub mod error;
pub mod manager;
pub mod selector;
pub mod signer;
pub mod utxo;

pub use error::WalletError;
pub use manager::{BitcoinQuirks, ChainQuirks, ContractCall, QtumQuirks, TransferDraft, WalletManager};
pub use selector::{select_utxos, Selection, SelectionParams};
pub use signer::{
    input_sighashes, insert_signatures, sign_transaction, verify_transaction, SecretBytes, SignatureSlot,
    SpendPath, UnlockDescriptor,
};
pub use utxo::{total_amount, Destination, UnspentOutput};
