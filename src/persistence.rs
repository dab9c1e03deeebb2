//! Persistence: durable storage for classified, attributed contract rows and
//! per-chain scan cursors.
//!
//! Writes are batched (up to 100 rows, or every 500ms, whichever comes
//! first) and applied in a single transaction per batch. A batch that fails
//! is retried with backoff (base 1s, doubling, capped at 30s) up to 5
//! attempts before the failure escalates to the supervisor as fatal.

use std::time::Duration;

use sqlx::sqlite::{SqlitePoolOptions, SqliteConnectOptions};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::error::PersistenceError;
use crate::model::ContractRow;

const BATCH_MAX_ROWS: usize = 100;
const BATCH_MAX_WAIT: Duration = Duration::from_millis(500);
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);
const QUEUE_CAPACITY: usize = 10_000;

/// Durable sink for enriched contract rows and chain cursors.
///
/// Runs a single background writer task so all batches are serialized; the
/// handle returned by [`Store::open`] is cheap to clone and `enqueue`/
/// `advance_cursor` are non-blocking unless the internal queue is full.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<WriteOp>,
    /// Carries `Some(message)` once a batch exhausts its write retries;
    /// the supervisor watches this to turn a persistence failure into a
    /// fatal, shutdown-triggering condition instead of silent data loss.
    fatal: watch::Receiver<Option<String>>,
}

enum WriteOp {
    Row(ContractRow),
    Cursor { chain: String, last_processed_block: u64 },
    /// Replies with the number of rows committed by the flush this call
    /// triggered.
    Flush(oneshot::Sender<usize>),
    LoadCursor {
        chain: String,
        reply: oneshot::Sender<Result<Option<u64>, PersistenceError>>,
    },
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `url` and runs
    /// embedded migrations before accepting writes.
    pub async fn open(url: &str) -> Result<Self, PersistenceError> {
        let options: SqliteConnectOptions = url.parse::<SqliteConnectOptions>()?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (fatal_tx, fatal_rx) = watch::channel(None);
        tokio::spawn(writer_loop(pool, rx, fatal_tx));
        Ok(Self { tx, fatal: fatal_rx })
    }

    /// A receiver that resolves to `Some(message)` the moment a batch write
    /// permanently fails. The supervisor polls this independently of the
    /// write path to decide when to initiate shutdown.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.clone()
    }

    /// Queues a classified, attributed row for the next batch write.
    pub async fn enqueue(&self, row: ContractRow) {
        if self.tx.send(WriteOp::Row(row)).await.is_err() {
            tracing::error!("persistence writer task is gone, dropping row");
        }
    }

    /// Queues a cursor update; last write for a chain wins within a batch.
    pub async fn advance_cursor(&self, chain: String, last_processed_block: u64) {
        if self
            .tx
            .send(WriteOp::Cursor { chain, last_processed_block })
            .await
            .is_err()
        {
            tracing::error!("persistence writer task is gone, dropping cursor update");
        }
    }

    /// Reads the last persisted cursor for `chain`, if any.
    pub async fn load_cursor(pool: &SqlitePool, chain: &str) -> Result<Option<u64>, PersistenceError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_processed_block FROM monitoring_state WHERE network = ?")
                .bind(chain)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(v,)| v as u64))
    }

    /// Reads the last persisted cursor for `chain` through the writer task,
    /// so callers never need direct access to the connection pool.
    pub async fn load_cursor_for_chain(&self, chain: &str) -> Result<Option<u64>, PersistenceError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(WriteOp::LoadCursor { chain: chain.to_string(), reply: reply_tx })
            .await
            .map_err(|_| PersistenceError::BatchExhausted {
                attempts: 0,
                source: sqlx::Error::PoolClosed,
            })?;
        reply_rx.await.map_err(|_| PersistenceError::BatchExhausted {
            attempts: 0,
            source: sqlx::Error::PoolClosed,
        })?
    }

    /// Blocks until every write queued before this call has been committed,
    /// returning the number of rows persisted by that flush.
    pub async fn flush(&self) -> usize {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).await.is_ok() {
            done_rx.await.unwrap_or(0)
        } else {
            0
        }
    }

    /// Flushes and drops the sender, letting the writer task exit once
    /// drained. Returns the number of rows persisted by the final flush.
    pub async fn close(self) -> usize {
        self.flush().await
    }
}

async fn writer_loop(pool: SqlitePool, mut rx: mpsc::Receiver<WriteOp>, fatal: watch::Sender<Option<String>>) {
    let mut ticker = tokio::time::interval(BATCH_MAX_WAIT);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut rows = Vec::with_capacity(BATCH_MAX_ROWS);
    let mut cursors: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
    let mut pending_flushes = Vec::new();

    loop {
        tokio::select! {
            maybe_op = rx.recv() => {
                match maybe_op {
                    Some(WriteOp::Row(row)) => {
                        rows.push(row);
                        if rows.len() >= BATCH_MAX_ROWS {
                            flush_batch(&pool, &mut rows, &mut cursors, &mut pending_flushes, &fatal).await;
                        }
                    }
                    Some(WriteOp::Cursor { chain, last_processed_block }) => {
                        cursors.insert(chain, last_processed_block);
                    }
                    Some(WriteOp::Flush(done)) => {
                        pending_flushes.push(done);
                        flush_batch(&pool, &mut rows, &mut cursors, &mut pending_flushes, &fatal).await;
                    }
                    Some(WriteOp::LoadCursor { chain, reply }) => {
                        // In-flight updates for this chain have not been committed
                        // yet; flush first so the read reflects the latest value.
                        flush_batch(&pool, &mut rows, &mut cursors, &mut pending_flushes, &fatal).await;
                        let _ = reply.send(Store::load_cursor(&pool, &chain).await);
                    }
                    None => {
                        flush_batch(&pool, &mut rows, &mut cursors, &mut pending_flushes, &fatal).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !rows.is_empty() || !cursors.is_empty() {
                    flush_batch(&pool, &mut rows, &mut cursors, &mut pending_flushes, &fatal).await;
                }
            }
        }
    }
}

async fn flush_batch(
    pool: &SqlitePool,
    rows: &mut Vec<ContractRow>,
    cursors: &mut std::collections::HashMap<String, u64>,
    pending_flushes: &mut Vec<oneshot::Sender<usize>>,
    fatal: &watch::Sender<Option<String>>,
) {
    if rows.is_empty() && cursors.is_empty() {
        for done in pending_flushes.drain(..) {
            let _ = done.send(0);
        }
        return;
    }

    let persisted = rows.len();
    match write_batch_with_retry(pool, rows, cursors).await {
        Ok(()) => {
            rows.clear();
            cursors.clear();
            for done in pending_flushes.drain(..) {
                let _ = done.send(persisted);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "batch write exhausted retries, escalating fatal persistence failure");
            fatal.send_replace(Some(e.to_string()));
            rows.clear();
            cursors.clear();
            for done in pending_flushes.drain(..) {
                let _ = done.send(0);
            }
        }
    }
}

async fn write_batch_with_retry(
    pool: &SqlitePool,
    rows: &[ContractRow],
    cursors: &std::collections::HashMap<String, u64>,
) -> Result<(), PersistenceError> {
    let mut backoff = RETRY_BASE_BACKOFF;
    let mut last_err = None;

    for attempt in 0..RETRY_ATTEMPTS {
        match write_batch_once(pool, rows, cursors).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "batch write failed, retrying");
                last_err = Some(e);
                if attempt + 1 < RETRY_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                }
            }
        }
    }

    Err(PersistenceError::BatchExhausted {
        attempts: RETRY_ATTEMPTS,
        source: last_err.expect("loop ran at least once"),
    })
}

async fn write_batch_once(
    pool: &SqlitePool,
    rows: &[ContractRow],
    cursors: &std::collections::HashMap<String, u64>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for row in rows {
        let metadata_json = serde_json::to_string(&row.contract_info).unwrap_or_else(|_| "{}".into());
        sqlx::query(
            "INSERT INTO contracts (
                network, contract_address, deployer_address, entity_name, entity_id,
                block_number, transaction_hash, contract_type, contract_info,
                factory_address, deployment_type, timestamp
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (network, contract_address) DO UPDATE SET
                deployer_address = excluded.deployer_address,
                entity_name = excluded.entity_name,
                entity_id = excluded.entity_id,
                block_number = excluded.block_number,
                transaction_hash = excluded.transaction_hash,
                contract_type = excluded.contract_type,
                contract_info = excluded.contract_info,
                factory_address = excluded.factory_address,
                deployment_type = excluded.deployment_type,
                timestamp = excluded.timestamp",
        )
        .bind(&row.network)
        .bind(&row.contract_address)
        .bind(&row.deployer_address)
        .bind(&row.entity_name)
        .bind(&row.entity_id)
        .bind(row.block_number as i64)
        .bind(&row.transaction_hash)
        .bind(row.contract_type.as_str())
        .bind(metadata_json)
        .bind(&row.factory_address)
        .bind(row.deployment_type.as_str())
        .bind(row.timestamp.to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }

    for (chain, block) in cursors {
        sqlx::query(
            "INSERT INTO monitoring_state (network, last_processed_block, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT (network) DO UPDATE SET
                last_processed_block = excluded.last_processed_block,
                updated_at = excluded.updated_at",
        )
        .bind(chain)
        .bind(*block as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContractType, DeploymentKind};

    fn sample_row() -> ContractRow {
        ContractRow {
            network: "ethereum".into(),
            contract_address: "0xabc".into(),
            deployer_address: "0xdef".into(),
            entity_name: Some("Uniswap".into()),
            entity_id: Some("uniswap".into()),
            block_number: 100,
            transaction_hash: "0xhash".into(),
            contract_type: ContractType::Erc20,
            contract_info: Default::default(),
            factory_address: None,
            deployment_type: DeploymentKind::Direct,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_runs_migrations_and_accepts_writes() {
        let store = Store::open("sqlite::memory:").await.expect("open should succeed");
        store.enqueue(sample_row()).await;
        let persisted = store.flush().await;
        assert_eq!(persisted, 1);
        store.close().await;
    }

    async fn test_store() -> (Store, SqlitePool) {
        let url = "sqlite::memory:";
        let options: SqliteConnectOptions = url.parse::<SqliteConnectOptions>().unwrap().create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let (fatal_tx, fatal_rx) = watch::channel(None);
        tokio::spawn(writer_loop(pool.clone(), rx, fatal_tx));
        (Store { tx, fatal: fatal_rx }, pool)
    }

    #[tokio::test]
    async fn cursor_round_trips_through_store() {
        let (store, pool) = test_store().await;

        store.advance_cursor("ethereum".into(), 42).await;
        store.flush().await;

        let cursor = Store::load_cursor(&pool, "ethereum").await.unwrap();
        assert_eq!(cursor, Some(42));
    }

    #[tokio::test]
    async fn enqueuing_same_key_twice_then_flushing_upserts_a_single_row() {
        let (store, pool) = test_store().await;

        let mut row = sample_row();
        store.enqueue(row.clone()).await;
        row.entity_name = Some("Uniswap v2".into());
        store.enqueue(row).await;
        let persisted = store.flush().await;
        assert_eq!(persisted, 2, "both enqueues are part of the same batch");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contracts WHERE network = ? AND contract_address = ?")
            .bind("ethereum")
            .bind("0xabc")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1, "the conflicting key collapses to one row");

        let name: (Option<String>,) = sqlx::query_as("SELECT entity_name FROM contracts WHERE network = ? AND contract_address = ?")
            .bind("ethereum")
            .bind("0xabc")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(name.0.as_deref(), Some("Uniswap v2"), "the later write wins");
    }
}
