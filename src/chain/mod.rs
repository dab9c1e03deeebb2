//! Chain adapter abstractions.
//!
//! [`ChainAdapter`] is the seam between the ingestion pipeline and a concrete
//! EVM JSON-RPC backend. The pipeline (extractor, classifier, worker) only
//! ever talks to this trait, never to `alloy` directly, so the read surface
//! stays typed and small (design notes, §9: "typed at the boundary, opaque in
//! transit").

pub mod eip155;

use async_trait::async_trait;

use crate::error::TransportError;

/// A transaction as seen inside a scanned block: only the fields the
/// extractor needs to detect direct deployments.
#[derive(Debug, Clone)]
pub struct ScannedTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub index: u64,
}

/// A block with full transaction bodies.
#[derive(Debug, Clone)]
pub struct ScannedBlock {
    pub number: u64,
    pub transactions: Vec<ScannedTransaction>,
}

/// A single event log entry from a transaction receipt.
#[derive(Debug, Clone)]
pub struct ScannedLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    pub log_index: u64,
}

/// A transaction receipt: creation address (if any) plus emitted logs.
#[derive(Debug, Clone)]
pub struct ScannedReceipt {
    pub contract_address: Option<String>,
    pub logs: Vec<ScannedLog>,
}

/// Read-only access to one EVM-compatible chain, with endpoint failover.
///
/// Implementations own an ordered list of RPC endpoints and must retry /
/// rotate internally per §4.1: round-robin on failure, exponential backoff
/// after a full rotation, up to 3 attempts per logical call.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Label used in logs and persisted rows (the configured chain name).
    fn chain_name(&self) -> &str;

    /// Current chain tip.
    async fn latest_height(&self) -> Result<u64, TransportError>;

    /// A block with full transaction bodies.
    async fn get_block_with_transactions(
        &self,
        height: u64,
    ) -> Result<ScannedBlock, TransportError>;

    /// The receipt for a transaction, including logs and creation address.
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<ScannedReceipt, TransportError>;

    /// Deployed bytecode at an address. Empty for EOAs or unused addresses.
    async fn get_code(&self, address: &str) -> Result<Vec<u8>, TransportError>;

    /// A raw `eth_call` against `address` with pre-encoded `calldata`.
    async fn eth_call(&self, address: &str, calldata: &[u8]) -> Result<Vec<u8>, TransportError>;
}
