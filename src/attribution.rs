//! Attribution Client: resolves a deployer address to an entity name via an
//! external HTTP lookup service.
//!
//! Three layers sit in front of the network call, in order: a TTL cache
//! (positive and negative results, 1 hour), in-flight request coalescing so
//! concurrent lookups for the same `(chain, address)` share one HTTP round
//! trip, and a token-bucket rate limiter capping outbound request volume.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use moka::future::Cache;
use serde::Deserialize;
use tokio::sync::OnceCell;

const CACHE_TTL: Duration = Duration::from_secs(3600);
const CACHE_CAPACITY: u64 = 100_000;
const RATE_LIMIT_PER_SECOND: u32 = 20;
/// A plain network failure gets exactly one retry after this delay.
const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Default wait before the single 429 retry when the response carries no
/// `Retry-After` header.
const DEFAULT_RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(2);

type SharedRateLimiter = Arc<
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
>;

/// The result of an attribution lookup, cached either way.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttributionResponse {
    #[serde(default)]
    entity_name: Option<String>,
    #[serde(default)]
    entity_id: Option<String>,
}

/// A slot shared by every concurrent lookup of the same key: the first caller
/// populates it, everyone else awaits the same [`OnceCell`].
type CoalesceSlot = Arc<OnceCell<Attribution>>;

pub struct AttributionClient {
    http: reqwest::Client,
    base_url: url::Url,
    api_key: Option<String>,
    cache: Cache<String, Attribution>,
    rate_limiter: SharedRateLimiter,
    in_flight: DashMap<String, CoalesceSlot>,
}

impl AttributionClient {
    pub fn new(base_url: url::Url, api_key: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self {
            http,
            base_url,
            api_key,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(RATE_LIMIT_PER_SECOND).expect("rate limit constant is nonzero"),
            ))),
            in_flight: DashMap::new(),
        }
    }

    fn cache_key(chain: &str, address: &str) -> String {
        format!("{chain}:{address}")
    }

    /// Resolves `address` on `chain` to an entity, consulting cache, then
    /// coalescing concurrent lookups, then the network.
    pub async fn attribute(&self, chain: &str, address: &str) -> Attribution {
        let key = Self::cache_key(chain, address);

        if let Some(hit) = self.cache.get(&key).await {
            return hit;
        }

        let slot = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = slot
            .get_or_init(|| async {
                let resolved = self.resolve_with_retry(chain, address).await;
                self.cache.insert(key.clone(), resolved.clone()).await;
                resolved
            })
            .await
            .clone();

        // Only the caller that actually populated the slot should remove it;
        // removing unconditionally is safe since a fresh lookup for the same
        // key afterward will either hit the cache or build a new slot.
        self.in_flight.remove(&key);

        result
    }

    /// A network failure retries once after a flat delay; a 429 retries once
    /// after the server's `Retry-After` (or a default); any other failure is
    /// not retried. Either way, a failure that survives its retry logs once
    /// and the result caches as negative.
    async fn resolve_with_retry(&self, chain: &str, address: &str) -> Attribution {
        self.rate_limiter.until_ready().await;
        let retry_delay = match self.resolve_once(chain, address).await {
            Ok(attribution) => return attribution,
            Err(LookupError::Network(e)) => {
                tracing::debug!(chain, address, error = %e, "attribution lookup network error, retrying once");
                NETWORK_RETRY_DELAY
            }
            Err(LookupError::RateLimited(retry_after)) => {
                tracing::debug!(chain, address, retry_after_secs = retry_after.as_secs(), "attribution service rate-limited us, retrying once");
                retry_after
            }
            Err(LookupError::Other(msg)) => {
                tracing::warn!(chain, address, error = %msg, "attribution lookup failed, caching negative result");
                return Attribution::default();
            }
        };

        tokio::time::sleep(retry_delay).await;
        self.rate_limiter.until_ready().await;
        match self.resolve_once(chain, address).await {
            Ok(attribution) => attribution,
            Err(e) => {
                tracing::warn!(chain, address, error = %e, "attribution lookup failed after retry, caching negative result");
                Attribution::default()
            }
        }
    }

    async fn resolve_once(&self, chain: &str, address: &str) -> Result<Attribution, LookupError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("chain", chain)
            .append_pair("address", address);

        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(LookupError::Network)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_RETRY_AFTER);
            return Err(LookupError::RateLimited(retry_after));
        }
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Attribution::default());
        }
        if !response.status().is_success() {
            return Err(LookupError::Other(format!(
                "attribution service returned {}",
                response.status()
            )));
        }

        let body: AttributionResponse = response
            .json()
            .await
            .map_err(|e| LookupError::Other(e.to_string()))?;
        Ok(Attribution {
            entity_name: body.entity_name,
            entity_id: body.entity_id,
        })
    }
}

/// Classifies an [`AttributionClient::resolve_once`] failure for the
/// differentiated retry policy: a network failure and a 429 each earn one
/// retry with their own delay, anything else is treated as persistent.
enum LookupError {
    Network(reqwest::Error),
    RateLimited(Duration),
    Other(String),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::Network(e) => write!(f, "network error: {e}"),
            LookupError::RateLimited(d) => write!(f, "rate limited, retry after {}s", d.as_secs()),
            LookupError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_key_is_chain_scoped() {
        assert_ne!(
            AttributionClient::cache_key("ethereum", "0xabc"),
            AttributionClient::cache_key("base", "0xabc"),
        );
    }

    #[tokio::test]
    async fn repeated_lookups_for_same_key_share_cached_value() {
        let client = AttributionClient::new(
            url::Url::parse("http://127.0.0.1:1").unwrap(),
            None,
            Duration::from_millis(50),
        );
        // Both the network call and the negative-result cache path are
        // exercised here: the unreachable URL exhausts retries, the negative
        // result is cached, and the second call must not hit the network again.
        let first = client.attribute("ethereum", "0xabc").await;
        assert!(first.entity_name.is_none());
        let cached = client.cache.get(&AttributionClient::cache_key("ethereum", "0xabc")).await;
        assert!(cached.is_some());
    }
}
