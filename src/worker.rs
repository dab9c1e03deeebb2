//! Chain Worker: the per-chain state machine driving extraction,
//! classification, attribution and persistence in a loop.
//!
//! States: `Initializing -> Scanning -> Backoff -> Reinit -> Stopped`. Every
//! transport error increments a consecutive-error counter `k` and enters
//! `Backoff` for `min(300s, BLOCK_CHECK_INTERVAL * 2^min(k-1, 5))`; once `k`
//! reaches 5 the chain adapter is rebuilt (`Reinit`) before resuming
//! `Scanning`. A cancellation request from the supervisor drives any state to
//! `Stopped`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::attribution::AttributionClient;
use crate::chain::ChainAdapter;
use crate::classifier;
use crate::extractor::{self, FactorySignature};
use crate::model::{AttributedDeployment, ClassifiedDeployment, ContractRow};
use crate::persistence::Store;

const BLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(12);
const BATCH_SIZE: u64 = 10;
const REINIT_THRESHOLD: u32 = 5;
const BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Scanning,
    Backoff,
    Reinit,
    Stopped,
}

/// Computes the backoff duration for consecutive-error count `k` per §4.6:
/// `min(300s, BLOCK_CHECK_INTERVAL * 2^min(k-1, 5))`.
fn backoff_for(k: u32) -> Duration {
    let exponent = k.saturating_sub(1).min(5);
    BLOCK_CHECK_INTERVAL
        .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .min(BACKOFF_MAX)
}

/// Builds a fresh [`ChainAdapter`] for a chain; called on startup and again
/// whenever the worker transitions through `Reinit`.
pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn ChainAdapter> + Send + Sync>;

pub struct ChainWorker {
    pub chain_name: String,
    adapter_factory: AdapterFactory,
    factory_signatures: Vec<FactorySignature>,
    attribution: Arc<AttributionClient>,
    store: Store,
    shutdown: CancellationToken,
    state: WorkerState,
    consecutive_errors: u32,
}

impl ChainWorker {
    pub fn new(
        chain_name: String,
        adapter_factory: AdapterFactory,
        factory_signatures: Vec<FactorySignature>,
        attribution: Arc<AttributionClient>,
        store: Store,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chain_name,
            adapter_factory,
            factory_signatures,
            attribution,
            store,
            shutdown,
            state: WorkerState::Initializing,
            consecutive_errors: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs until cancelled. Never returns an error: fatal conditions are
    /// logged and the worker settles into `Stopped`, leaving supervisor-level
    /// escalation to the caller observing the worker's exit.
    pub async fn run(mut self) {
        let mut adapter = (self.adapter_factory)();
        let mut cursor = self
            .store
            .load_cursor_for_chain(&self.chain_name)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(chain = %self.chain_name, error = %e, "failed to load cursor, starting from chain tip");
                None
            });
        self.state = WorkerState::Scanning;

        loop {
            if self.shutdown.is_cancelled() {
                self.state = WorkerState::Stopped;
                tracing::info!(chain = %self.chain_name, "shutdown requested, stopping worker");
                break;
            }

            match self.state {
                WorkerState::Scanning => {
                    match self.scan_once(adapter.as_ref(), &mut cursor).await {
                        Ok(made_progress) => {
                            self.consecutive_errors = 0;
                            if !made_progress {
                                tokio::select! {
                                    _ = tokio::time::sleep(BLOCK_CHECK_INTERVAL) => {}
                                    _ = self.shutdown.cancelled() => {}
                                }
                            }
                        }
                        Err(e) => {
                            self.consecutive_errors += 1;
                            tracing::warn!(chain = %self.chain_name, error = %e, consecutive_errors = self.consecutive_errors, "scan iteration failed");
                            self.state = if self.consecutive_errors >= REINIT_THRESHOLD {
                                WorkerState::Reinit
                            } else {
                                WorkerState::Backoff
                            };
                        }
                    }
                }
                WorkerState::Backoff => {
                    let backoff = backoff_for(self.consecutive_errors);
                    tracing::warn!(chain = %self.chain_name, backoff_secs = backoff.as_secs(), "backing off after repeated errors");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                    self.state = WorkerState::Scanning;
                }
                WorkerState::Reinit => {
                    tracing::warn!(chain = %self.chain_name, "rebuilding chain adapter after sustained failures");
                    adapter = (self.adapter_factory)();
                    self.consecutive_errors = 0;
                    self.state = WorkerState::Scanning;
                }
                WorkerState::Initializing | WorkerState::Stopped => unreachable!("loop only runs after Initializing and breaks on Stopped"),
            }
        }
    }

    /// Scans one batch of blocks starting after the current cursor. Returns
    /// `Ok(true)` if any blocks were processed, `Ok(false)` if the chain tip
    /// had not advanced.
    async fn scan_once(
        &self,
        adapter: &dyn ChainAdapter,
        cursor: &mut Option<u64>,
    ) -> Result<bool, crate::error::TransportError> {
        let tip = adapter.latest_height().await?;
        let from = cursor.map(|c| c + 1).unwrap_or(tip);
        if from > tip {
            return Ok(false);
        }
        let to = (from + BATCH_SIZE - 1).min(tip);

        let extraction = extractor::extract_range(adapter, from, to, &self.factory_signatures).await;
        if !extraction.failed_blocks.is_empty() {
            tracing::warn!(chain = %self.chain_name, failed = ?extraction.failed_blocks, "some blocks in range could not be fetched");
        }

        let found = extraction.deployments.len();
        if found > 0 {
            tracing::info!(chain = %self.chain_name, from, to, found, "processing block range");
        }

        for deployment in extraction.deployments {
            let (outcome, metadata) = classifier::classify(adapter, &deployment.contract_address).await;
            tracing::info!(
                chain = %self.chain_name,
                address = %deployment.contract_address,
                contract_type = outcome.primary_type.as_str(),
                confidence = outcome.confidence,
                "classified deployment"
            );
            let classified = ClassifiedDeployment {
                deployment,
                primary_type: outcome.primary_type,
                matched_types: outcome.matched_types,
                confidence: outcome.confidence,
                bytecode_size: outcome.bytecode_size,
                metadata,
            };

            let attribution = self
                .attribution
                .attribute(&self.chain_name, &classified.deployment.deployer_address)
                .await;
            match &attribution.entity_name {
                Some(name) => tracing::info!(chain = %self.chain_name, address = %classified.deployment.deployer_address, entity = %name, "deployer belongs to entity"),
                None => tracing::info!(chain = %self.chain_name, address = %classified.deployment.deployer_address, "no entity found for deployer"),
            }

            let attributed = AttributedDeployment {
                classified,
                entity_name: attribution.entity_name,
                entity_id: attribution.entity_id,
            };

            let row: ContractRow = attributed.into();
            tracing::info!(chain = %self.chain_name, address = %row.contract_address, "queued contract");
            self.store.enqueue(row).await;
        }

        *cursor = Some(to);
        self.store.advance_cursor(self.chain_name.clone(), to).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_then_caps_at_300s() {
        assert_eq!(backoff_for(1), BLOCK_CHECK_INTERVAL);
        assert_eq!(backoff_for(2), BLOCK_CHECK_INTERVAL * 2);
        assert_eq!(backoff_for(3), BLOCK_CHECK_INTERVAL * 4);
        assert_eq!(backoff_for(8), BACKOFF_MAX);
    }

    #[test]
    fn reinit_threshold_matches_spec() {
        assert_eq!(REINIT_THRESHOLD, 5);
    }
}
