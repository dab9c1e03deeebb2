//! Multi-chain EVM contract deployment discovery, classification, and
//! entity attribution.

pub mod attribution;
pub mod chain;
pub mod classifier;
pub mod config;
pub mod error;
pub mod extractor;
pub mod model;
pub mod persistence;
pub mod sig_down;
pub mod supervisor;
pub mod telemetry;
pub mod worker;
