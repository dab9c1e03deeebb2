//! Deployment Extractor: turns a block range into an ordered sequence of
//! [`Deployment`] events.
//!
//! Two detection paths per §4.2: a transaction with an empty `to` is a direct
//! deployment; a transaction whose receipt emits a log matching a configured
//! factory-event signature is a factory deployment. A single failing block is
//! recorded and skipped rather than aborting the whole range.

use chrono::Utc;

use crate::chain::{ChainAdapter, ScannedLog};
use crate::error::ProtocolError;
use crate::model::{Deployment, DeploymentKind};

/// A configured factory-event signature: which log indicates a child contract
/// was created, and where in the log's data the child address (and, if
/// present, a deployer hint) sits.
///
/// This is data, not a hard-coded constant (design notes, §9): operators add
/// rows as new factory patterns are observed, no rebuild required.
#[derive(Debug, Clone)]
pub struct FactorySignature {
    /// `topic0` of the matching log, lowercase hex, 0x-prefixed.
    pub topic0: String,
    /// Byte offset into `log.data` of the 32-byte word holding the child
    /// address (right-aligned, as with a standard `address` ABI encoding).
    pub child_word_offset: usize,
    /// Optional byte offset into `log.data` of a 32-byte word holding a
    /// deployer hint; unused today (deployer is always the tx origin) but
    /// kept so a future signature with a more precise hint can opt in.
    pub deployer_word_offset: Option<usize>,
}

/// Result of extracting one range: the deployments found, in order, plus the
/// block numbers that could not be fetched at all.
#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub deployments: Vec<Deployment>,
    pub failed_blocks: Vec<u64>,
}

/// Extracts deployments for `[from, to]` inclusive.
pub async fn extract_range(
    adapter: &dyn ChainAdapter,
    from: u64,
    to: u64,
    factory_signatures: &[FactorySignature],
) -> ExtractionResult {
    let mut result = ExtractionResult::default();

    for height in from..=to {
        let block = match adapter.get_block_with_transactions(height).await {
            Ok(block) => block,
            Err(e) => {
                let err = ProtocolError::MalformedBlock(height, e.to_string());
                tracing::warn!(chain = %adapter.chain_name(), error = %err, "failed to fetch block, skipping");
                result.failed_blocks.push(height);
                continue;
            }
        };

        for tx in &block.transactions {
            let receipt = match adapter.get_transaction_receipt(&tx.hash).await {
                Ok(r) => r,
                Err(e) => {
                    let err = ProtocolError::MalformedReceipt(tx.hash.clone(), e.to_string());
                    tracing::warn!(chain = %adapter.chain_name(), block = height, error = %err, "failed to fetch receipt, skipping transaction");
                    continue;
                }
            };

            if tx.to.is_none() {
                if let Some(contract_address) = receipt.contract_address.clone() {
                    result.deployments.push(Deployment {
                        contract_address,
                        chain: adapter.chain_name().to_string(),
                        deployer_address: tx.from.clone(),
                        block_number: height,
                        tx_index: tx.index,
                        log_index: None,
                        transaction_hash: tx.hash.clone(),
                        kind: DeploymentKind::Direct,
                        factory_address: None,
                        created_at: Utc::now(),
                    });
                } else {
                    tracing::warn!(chain = %adapter.chain_name(), block = height, tx = %tx.hash, "empty-to transaction had no contract_address in receipt");
                }
            }

            for log in &receipt.logs {
                if let Some(child) = match_factory_log(log, factory_signatures) {
                    result.deployments.push(Deployment {
                        contract_address: child,
                        chain: adapter.chain_name().to_string(),
                        deployer_address: tx.from.clone(),
                        block_number: height,
                        tx_index: tx.index,
                        log_index: Some(log.log_index),
                        transaction_hash: tx.hash.clone(),
                        kind: DeploymentKind::Factory,
                        factory_address: Some(log.address.clone()),
                        created_at: Utc::now(),
                    });
                }
            }
        }
    }

    result.deployments.sort_by_key(|d| d.order_key());
    result
}

/// Checks a log against the configured factory signatures and, on a match,
/// decodes the child contract address from the log's data.
fn match_factory_log(log: &ScannedLog, signatures: &[FactorySignature]) -> Option<String> {
    let topic0 = log.topics.first()?;
    let sig = signatures.iter().find(|s| &s.topic0 == topic0)?;

    let start = sig.child_word_offset;
    match log.data.get(start..start + 32) {
        // A 32-byte ABI-encoded `address` is right-aligned; the address is
        // the last 20 bytes of the word.
        Some(word) => Some(format!("0x{}", hex::encode(&word[12..32]))),
        None => {
            let err = ProtocolError::MalformedFactoryLog(format!(
                "log on {} matched topic0 {topic0} but data has no word at offset {start}",
                log.address
            ));
            tracing::warn!(error = %err, "malformed factory log, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_child(topic0: &str, child: [u8; 20]) -> ScannedLog {
        let mut data = vec![0u8; 32];
        data[12..32].copy_from_slice(&child);
        ScannedLog {
            address: "0xffffffffffffffffffffffffffffffffffffffff".into(),
            topics: vec![topic0.to_string()],
            data,
            log_index: 0,
        }
    }

    #[test]
    fn matches_configured_signature_and_decodes_child() {
        let sig = FactorySignature {
            topic0: "0xabc".into(),
            child_word_offset: 0,
            deployer_word_offset: None,
        };
        let child = [0xBBu8; 20];
        let log = log_with_child("0xabc", child);
        let decoded = match_factory_log(&log, &[sig]).expect("should match");
        assert_eq!(decoded, format!("0x{}", hex::encode(child)));
    }

    #[test]
    fn ignores_log_with_unconfigured_topic() {
        let sig = FactorySignature {
            topic0: "0xabc".into(),
            child_word_offset: 0,
            deployer_word_offset: None,
        };
        let log = log_with_child("0xdead", [0x11u8; 20]);
        assert!(match_factory_log(&log, &[sig]).is_none());
    }

    #[test]
    fn deployment_order_key_sorts_direct_before_factory_in_same_tx() {
        let base = Deployment {
            contract_address: "0x1".into(),
            chain: "test".into(),
            deployer_address: "0xd".into(),
            block_number: 10,
            tx_index: 0,
            log_index: None,
            transaction_hash: "0xh".into(),
            kind: DeploymentKind::Direct,
            factory_address: None,
            created_at: Utc::now(),
        };
        let mut factory = base.clone();
        factory.kind = DeploymentKind::Factory;
        factory.log_index = Some(0);
        factory.contract_address = "0x2".into();

        let mut deployments = vec![factory.clone(), base.clone()];
        deployments.sort_by_key(|d| d.order_key());
        assert_eq!(deployments[0].contract_address, base.contract_address);
        assert_eq!(deployments[1].contract_address, factory.contract_address);
    }
}
