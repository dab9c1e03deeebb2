//! Error taxonomy for the contract-watch pipeline.
//!
//! Mirrors the failure regime a chain worker must react to: transport faults
//! trigger backoff/reinit, protocol and classifier faults drop a single item,
//! persistence faults escalate to the supervisor, and config faults abort
//! startup.

use std::fmt;

/// A network-level failure talking to an RPC endpoint or the attribution service.
///
/// Retried locally by the caller; repeated occurrences escalate a [`crate::worker::ChainWorker`]
/// from `Scanning` to `Backoff` and eventually `Reinit`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("all endpoints exhausted for {chain}: {last}")]
    EndpointsExhausted { chain: String, last: String },
    #[error("request to {endpoint} timed out after {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },
    #[error("rpc call failed: {0}")]
    Rpc(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A malformed or undecodable single item (block, log, receipt).
///
/// Logged and dropped; never aborts the containing range scan.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("block {0} could not be decoded: {1}")]
    MalformedBlock(u64, String),
    #[error("receipt for tx {0} could not be decoded: {1}")]
    MalformedReceipt(String, String),
    #[error("log data did not match expected factory-event shape: {0}")]
    MalformedFactoryLog(String),
}

/// A failed on-chain read during classification.
///
/// Metadata fields affected are set to absent; the contract's primary type tag
/// is only ever set to `Error` when bytecode itself could not be fetched.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("failed to fetch bytecode for {address}: {source}")]
    BytecodeFetch {
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("view call {selector} on {address} failed: {source}")]
    ViewCall {
        address: String,
        selector: &'static str,
        #[source]
        source: TransportError,
    },
}

/// A persistence transaction failure.
///
/// Retried with backoff up to a fixed attempt count; exhaustion is fatal and
/// triggers supervisor-initiated shutdown.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("batch write failed after {attempts} attempts: {source}")]
    BatchExhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

/// A startup-time configuration problem: missing credential, no usable chains,
/// or a persistence location that cannot be opened.
#[derive(Debug, thiserror::Error)]
pub enum FatalConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no usable EVM chains configured (all requested chains were unknown or non-EVM)")]
    NoUsableChains,
    #[error("missing required credential: {0}")]
    MissingCredential(String),
    #[error("environment variable {0} referenced in config was not set")]
    MissingEnvVar(String),
    #[error("persistence initialization failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Top-level application error used to compute the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] FatalConfigError),
    /// A batch write exhausted its retries; the supervisor observed the
    /// writer task's fatal signal and is already mid-shutdown by the time
    /// this is constructed.
    #[error("unrecoverable persistence failure: {0}")]
    Persistence(String),
    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Process exit code per the spec: 0 is reserved for clean shutdown and is
    /// never produced here, since this type only wraps startup/fatal failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 1,
            AppError::Persistence(_) => 2,
            AppError::Other(_) => 1,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse classification used by the worker state machine to decide whether a
/// failure counts toward the consecutive-error counter driving Backoff/Reinit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Transport,
    Other,
}
