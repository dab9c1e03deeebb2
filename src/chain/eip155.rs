//! Alloy-backed [`ChainAdapter`] for EVM-compatible chains.
//!
//! Holds an ordered list of RPC endpoints and fails over between them on any
//! error, preferring whichever endpoint last succeeded. After a full
//! rotation fails, the adapter backs off exponentially (base 5s, doubling,
//! capped at 300s) and retries, up to 3 attempts per logical call, before
//! surfacing a [`TransportError`].

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types_eth::{BlockNumberOrTag, BlockTransactionsKind, TransactionRequest};
use alloy_rpc_types_eth::TransactionTrait;
use async_trait::async_trait;
use url::Url;

use super::{ChainAdapter, ScannedBlock, ScannedLog, ScannedReceipt, ScannedTransaction};
use crate::error::TransportError;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// An EVM chain adapter backed by one [`RootProvider`] per configured endpoint.
pub struct Eip155ChainAdapter {
    chain_name: String,
    endpoints: Vec<Url>,
    providers: Vec<RootProvider>,
    /// Index of the endpoint to try first (the last one that succeeded).
    preferred: AtomicUsize,
    call_timeout: Duration,
}

impl Eip155ChainAdapter {
    /// Connects lazily: each endpoint gets its own HTTP-backed provider, but
    /// no RPC call is made until the adapter is first used.
    pub fn new(chain_name: String, endpoints: Vec<Url>, call_timeout: Duration) -> Self {
        let providers = endpoints
            .iter()
            .map(|url| ProviderBuilder::new().connect_http(url.clone()).root().clone())
            .collect();
        Self {
            chain_name,
            endpoints,
            providers,
            preferred: AtomicUsize::new(0),
            call_timeout,
        }
    }

    fn backoff_for(attempt: u32) -> Duration {
        let scaled = BASE_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(MAX_BACKOFF)
    }

    /// Runs `f` against each endpoint in round-robin order starting from the
    /// preferred one; on total failure, backs off and retries up to
    /// [`MAX_ATTEMPTS`] times.
    async fn call_with_failover<T, F>(&self, op: &str, mut f: F) -> Result<T, TransportError>
    where
        F: for<'a> FnMut(
            &'a RootProvider,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, String>> + Send + 'a>>,
    {
        let n = self.providers.len();
        let start = self.preferred.load(Ordering::Relaxed) % n;
        let mut last_err = String::from("no endpoints configured");

        for attempt in 0..MAX_ATTEMPTS {
            for i in 0..n {
                let idx = (start + i) % n;
                let endpoint = &self.endpoints[idx];
                match tokio::time::timeout(self.call_timeout, f(&self.providers[idx])).await {
                    Ok(Ok(value)) => {
                        self.preferred.store(idx, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(chain = %self.chain_name, endpoint = %endpoint, op, error = %e, "rpc call failed, trying next endpoint");
                        last_err = e;
                    }
                    Err(_) => {
                        let msg = format!("timed out after {}s", self.call_timeout.as_secs());
                        tracing::warn!(chain = %self.chain_name, endpoint = %endpoint, op, "rpc call timed out");
                        last_err = msg;
                    }
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                let backoff = Self::backoff_for(attempt);
                tracing::warn!(chain = %self.chain_name, op, attempt, backoff_secs = backoff.as_secs(), "full endpoint rotation failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }
        Err(TransportError::EndpointsExhausted {
            chain: self.chain_name.clone(),
            last: last_err,
        })
    }
}

fn addr_to_lower_hex(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

fn hash_to_hex(hash: B256) -> String {
    format!("0x{}", hex::encode(hash.as_slice()))
}

#[async_trait]
impl ChainAdapter for Eip155ChainAdapter {
    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    async fn latest_height(&self) -> Result<u64, TransportError> {
        self.call_with_failover("latest_height", |p| {
            Box::pin(async move { p.get_block_number().await.map_err(|e| e.to_string()) })
        })
        .await
    }

    async fn get_block_with_transactions(
        &self,
        height: u64,
    ) -> Result<ScannedBlock, TransportError> {
        let block = self
            .call_with_failover("get_block_with_transactions", |p| {
                Box::pin(async move {
                    p.get_block_by_number(BlockNumberOrTag::Number(height))
                        .kind(BlockTransactionsKind::Full)
                        .await
                        .map_err(|e| e.to_string())?
                        .ok_or_else(|| format!("block {height} not found"))
                })
            })
            .await?;

        let transactions = block
            .transactions
            .into_transactions()
            .enumerate()
            .map(|(index, tx)| ScannedTransaction {
                hash: hash_to_hex(*tx.inner.tx_hash()),
                from: addr_to_lower_hex(tx.inner.signer()),
                to: tx.inner.to().map(addr_to_lower_hex),
                index: index as u64,
            })
            .collect();

        Ok(ScannedBlock {
            number: height,
            transactions,
        })
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<ScannedReceipt, TransportError> {
        let hash = B256::from_str(tx_hash)
            .map_err(|e| TransportError::Rpc(format!("invalid tx hash {tx_hash}: {e}")))?;
        let receipt = self
            .call_with_failover("get_transaction_receipt", |p| {
                Box::pin(async move {
                    p.get_transaction_receipt(hash)
                        .await
                        .map_err(|e| e.to_string())?
                        .ok_or_else(|| format!("receipt for {hash} not found"))
                })
            })
            .await?;

        let logs = receipt
            .inner
            .logs()
            .iter()
            .enumerate()
            .map(|(i, log)| ScannedLog {
                address: addr_to_lower_hex(log.address()),
                topics: log.topics().iter().map(|t| hash_to_hex(*t)).collect(),
                data: log.data().data.to_vec(),
                log_index: log.log_index.unwrap_or(i as u64),
            })
            .collect();

        Ok(ScannedReceipt {
            contract_address: receipt.contract_address.map(addr_to_lower_hex),
            logs,
        })
    }

    async fn get_code(&self, address: &str) -> Result<Vec<u8>, TransportError> {
        let addr = Address::from_str(address)
            .map_err(|e| TransportError::Rpc(format!("invalid address {address}: {e}")))?;
        self.call_with_failover("get_code", |p| {
            Box::pin(async move {
                p.get_code_at(addr)
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| e.to_string())
            })
        })
        .await
    }

    async fn eth_call(&self, address: &str, calldata: &[u8]) -> Result<Vec<u8>, TransportError> {
        let addr = Address::from_str(address)
            .map_err(|e| TransportError::Rpc(format!("invalid address {address}: {e}")))?;
        let input = Bytes::copy_from_slice(calldata);
        self.call_with_failover("eth_call", |p| {
            let tx = TransactionRequest::default().to(addr).input(input.clone().into());
            Box::pin(async move { p.call(tx).await.map(|b| b.to_vec()).map_err(|e| e.to_string()) })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(Eip155ChainAdapter::backoff_for(0), Duration::from_secs(5));
        assert_eq!(Eip155ChainAdapter::backoff_for(1), Duration::from_secs(10));
        assert_eq!(Eip155ChainAdapter::backoff_for(2), Duration::from_secs(20));
        assert_eq!(Eip155ChainAdapter::backoff_for(6), Duration::from_secs(300));
        assert_eq!(Eip155ChainAdapter::backoff_for(20), Duration::from_secs(300));
    }
}
