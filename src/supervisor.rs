//! Supervisor: owns one [`ChainWorker`] per configured chain plus a
//! liveness monitor, and coordinates graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::attribution::AttributionClient;
use crate::chain::eip155::Eip155ChainAdapter;
use crate::chain::ChainAdapter;
use crate::config::ChainConfig;
use crate::error::AppError;
use crate::extractor::FactorySignature;
use crate::persistence::Store;
use crate::worker::{AdapterFactory, ChainWorker};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

struct ManagedWorker {
    chain_name: String,
    chain_config: ChainConfig,
    factory_signatures: Vec<FactorySignature>,
    attribution: Arc<AttributionClient>,
    store: Store,
    handle: JoinHandle<()>,
}

fn adapter_factory_for(chain_name: String, endpoints: Vec<url::Url>) -> AdapterFactory {
    Arc::new(move || {
        Arc::new(Eip155ChainAdapter::new(chain_name.clone(), endpoints.clone(), RPC_CALL_TIMEOUT)) as Arc<dyn ChainAdapter>
    })
}

fn spawn_worker(
    chain_name: String,
    chain_config: ChainConfig,
    factory_signatures: Vec<FactorySignature>,
    attribution: Arc<AttributionClient>,
    store: Store,
    shutdown: CancellationToken,
) -> ManagedWorker {
    let adapter_factory = adapter_factory_for(chain_name.clone(), chain_config.rpc_endpoints.clone());
    let worker = ChainWorker::new(
        chain_name.clone(),
        adapter_factory,
        factory_signatures.clone(),
        attribution.clone(),
        store.clone(),
        shutdown,
    );
    let handle = tokio::spawn(worker.run());
    ManagedWorker {
        chain_name,
        chain_config,
        factory_signatures,
        attribution,
        store,
        handle,
    }
}

/// Runs every configured chain's worker until `shutdown` is cancelled or a
/// persistence batch permanently fails, then drains and closes persistence.
///
/// A persistent batch-write failure (spec §4.5/§7: exhausted retries are
/// fatal) cancels `shutdown` itself so every worker observes the same signal
/// a supervisor-initiated shutdown would send, then is surfaced to the
/// caller as an error once the drain completes.
pub async fn run(
    chains: HashMap<String, ChainConfig>,
    factory_signatures: Vec<FactorySignature>,
    attribution: Arc<AttributionClient>,
    store: Store,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let mut fatal = store.fatal_signal();

    let mut workers: Vec<ManagedWorker> = chains
        .into_iter()
        .map(|(name, cfg)| {
            spawn_worker(name, cfg, factory_signatures.clone(), attribution.clone(), store.clone(), shutdown.clone())
        })
        .collect();

    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    liveness.tick().await; // first tick fires immediately; skip it

    let mut fatal_error = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown signal received, waiting for chain workers");
                break;
            }
            Ok(()) = fatal.changed() => {
                if let Some(message) = fatal.borrow_and_update().clone() {
                    tracing::error!(error = %message, "persistence batch write exhausted retries, initiating shutdown");
                    fatal_error = Some(message);
                    shutdown.cancel();
                    break;
                }
            }
            _ = liveness.tick() => {
                for i in 0..workers.len() {
                    if workers[i].handle.is_finished() {
                        tracing::warn!(chain = %workers[i].chain_name, "worker terminated unexpectedly, restarting (cursor is authoritative, no progress lost)");
                        let dead = workers.remove(i);
                        let restarted = spawn_worker(
                            dead.chain_name,
                            dead.chain_config,
                            dead.factory_signatures,
                            dead.attribution,
                            dead.store,
                            shutdown.clone(),
                        );
                        workers.insert(i, restarted);
                        break;
                    }
                }
            }
        }
    }

    for worker in workers {
        match tokio::time::timeout(WORKER_JOIN_TIMEOUT, worker.handle).await {
            Ok(Ok(())) => tracing::info!(chain = %worker.chain_name, "worker stopped cleanly"),
            Ok(Err(e)) => tracing::error!(chain = %worker.chain_name, error = %e, "worker task panicked"),
            Err(_) => tracing::warn!(chain = %worker.chain_name, "worker did not stop within join timeout"),
        }
    }

    let persisted = store.close().await;
    tracing::info!(persisted, "persistence drained and closed, shutdown complete");

    match fatal_error {
        Some(message) => Err(AppError::Persistence(message)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_interval_matches_spec_default() {
        assert_eq!(LIVENESS_INTERVAL, Duration::from_secs(30));
    }

    #[test]
    fn worker_join_timeout_matches_spec_default() {
        assert_eq!(WORKER_JOIN_TIMEOUT, Duration::from_secs(5));
    }
}
