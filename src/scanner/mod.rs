//! Block scanning: chain backend interface, watched addresses, extraction
//! pipeline and the per-chain scan loop

pub mod block_scanner;
#[cfg(test)]
pub(crate) mod mock;
pub mod observer;
pub mod pipeline;
pub mod registry;
pub mod rpc;

pub use block_scanner::{BlockScanner, ScanError, ScanState, TickReport};
pub use observer::{BlockObserver, NotifyError};
pub use pipeline::{
    BatchResult, BlockRef, ExtractedRecord, ExtractionFailure, ExtractionPipeline, RecordInput, RecordOutput,
    TxOutcome,
};
pub use registry::{AddressLookup, AddressRegistry};
pub use rpc::{BlockHeader, BlockInfo, ChainRpc, RpcError, TxDetail, TxOutInfo, TxVin, TxVout};
