//! Async persistence worker (C4): a bounded channel in front of a single
//! consumer that batches, coalesces, and commits risk-state writes so the
//! trading loop never blocks on Postgres.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{RiskError, RiskResult};
use crate::persistence::queries;
use crate::risk::store::PersistHook;
use crate::risk::types::{Delta, RiskState, SetMarker};

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: StdDuration,
    pub max_retries: u32,
    pub backoff_base: StdDuration,
    pub backoff_cap: StdDuration,
    pub enqueue_timeout: StdDuration,
    pub drain_timeout: StdDuration,
    pub operation_deadline: StdDuration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_size: 512,
            batch_size: 32,
            flush_interval: StdDuration::from_millis(200),
            max_retries: 5,
            backoff_base: StdDuration::from_millis(150),
            backoff_cap: StdDuration::from_secs(3),
            enqueue_timeout: StdDuration::from_secs(10),
            drain_timeout: StdDuration::from_secs(30),
            operation_deadline: StdDuration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSubmission {
    pub trader_id: String,
    pub snapshot: RiskState,
    pub trace_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct DeltaSubmission {
    pub trader_id: String,
    pub delta: Delta,
}

enum QueueItem {
    Snapshot(SnapshotSubmission),
    Delta(DeltaSubmission),
}

enum Operation {
    Snapshot(SnapshotSubmission),
    Delta {
        trader_id: String,
        delta: Delta,
        trace_ids: Vec<String>,
    },
}

#[derive(Debug, Default)]
pub struct PersistenceMetrics {
    pub batches_committed: std::sync::atomic::AtomicU64,
    pub batches_failed: std::sync::atomic::AtomicU64,
    pub operations_dropped: std::sync::atomic::AtomicU64,
    pub enqueue_timeouts: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceMetricsSnapshot {
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub operations_dropped: u64,
    pub enqueue_timeouts: u64,
}

impl PersistenceMetrics {
    fn snapshot(&self) -> PersistenceMetricsSnapshot {
        PersistenceMetricsSnapshot {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            operations_dropped: self.operations_dropped.load(Ordering::Relaxed),
            enqueue_timeouts: self.enqueue_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Owns the channel, the background worker task, and the pool. `save` and
/// `save_delta` are the only producer-facing entry points; `close` is
/// idempotent and safe to call from multiple places during shutdown.
pub struct PersistenceWorker {
    pool: PgPool,
    tx: mpsc::Sender<QueueItem>,
    config: PersistenceConfig,
    closing: AtomicBool,
    closed_pool: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    pub metrics: Arc<PersistenceMetrics>,
}

impl PersistenceWorker {
    /// Connects with up to 3 retries (`1 << attempt` seconds backoff per
    /// §4.4.1), runs embedded migrations, and spawns the batching consumer.
    pub async fn connect(database_url: &str, config: PersistenceConfig) -> RiskResult<Arc<Self>> {
        let pool = connect_with_retries(database_url, 3).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: PgPool, config: PersistenceConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let metrics = Arc::new(PersistenceMetrics::default());
        let worker = Arc::new(Self {
            pool: pool.clone(),
            tx,
            config: config.clone(),
            closing: AtomicBool::new(false),
            closed_pool: AtomicBool::new(false),
            handle: Mutex::new(None),
            metrics: metrics.clone(),
        });

        let handle = tokio::spawn(run_consumer(pool, rx, config, metrics));
        if let Ok(mut guard) = worker.handle.try_lock() {
            *guard = Some(handle);
        }
        worker
    }

    pub fn metrics_snapshot(&self) -> PersistenceMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Non-blocking up to `enqueue_timeout`: queues a full snapshot for the
    /// batching worker to commit. Fails with `QueueFull` if the channel
    /// stays full past the timeout, or `ShuttingDown` once `close` has been
    /// called.
    pub async fn save(
        &self,
        trader_id: impl Into<String>,
        snapshot: RiskState,
        trace_id: Option<String>,
        reason: Option<String>,
    ) -> RiskResult<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RiskError::ShuttingDown);
        }
        let item = QueueItem::Snapshot(SnapshotSubmission {
            trader_id: trader_id.into(),
            snapshot,
            trace_id: trace_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            reason: reason.unwrap_or_default(),
        });
        self.enqueue(item).await
    }

    async fn enqueue(&self, item: QueueItem) -> RiskResult<()> {
        if self.config.enqueue_timeout.is_zero() {
            return self
                .tx
                .try_send(item)
                .map_err(|_| RiskError::QueueFull);
        }
        match tokio::time::timeout(self.config.enqueue_timeout, self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RiskError::ShuttingDown),
            Err(_) => {
                self.metrics
                    .enqueue_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                Err(RiskError::QueueFull)
            }
        }
    }

    /// Executes a single atomic upsert directly against the database,
    /// bypassing the queue. Intended for contention-heavy accumulators that
    /// want synchronous, retried persistence without batching overhead.
    /// Honors `operation_deadline` across all retries.
    pub async fn save_delta(&self, trader_id: &str, delta: Delta) -> RiskResult<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RiskError::ShuttingDown);
        }
        let trace_id = delta.trace_id.clone().unwrap_or_default();
        let reason = delta.reason.clone().unwrap_or_default();
        let deadline = tokio::time::Instant::now() + self.config.operation_deadline;

        let mut attempt = 0u32;
        loop {
            let result = tokio::time::timeout_at(
                deadline,
                commit_delta(&self.pool, trader_id, &delta, &trace_id, &reason),
            )
            .await;

            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(trader_id, attempt, error = %err, "delta commit failed, retrying");
                    tokio::time::sleep_until(
                        tokio::time::Instant::now()
                            + backoff_with_jitter(
                                attempt,
                                self.config.backoff_base,
                                self.config.backoff_cap,
                            ),
                    )
                    .await;
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(RiskError::Cancelled),
            }
        }
    }

    /// Idempotent shutdown: flips `closing` first so new `save`/`save_delta`
    /// calls are rejected immediately, drops the sender so the consumer
    /// drains and exits, waits up to `drain_timeout`, then closes the pool
    /// exactly once regardless of how many times `close` is called.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.config.drain_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!("persistence worker did not drain within drain_timeout");
            }
        }
        if !self.closed_pool.swap(true, Ordering::AcqRel) {
            self.pool.close().await;
        }
    }

    /// Reads the persisted row for `trader_id`, back-filling a NULL
    /// `last_reset_time` (legacy rows written before the column gained its
    /// `NOT NULL` constraint) with the read time.
    pub async fn load(&self, trader_id: &str) -> RiskResult<Option<RiskState>> {
        let row = sqlx::query(queries::SELECT_RISK_STATE)
            .bind(trader_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_reset_time: Option<DateTime<Utc>> = row.try_get("last_reset_time")?;
        let last_reset_time = match last_reset_time {
            Some(ts) => ts,
            None => {
                let now = Utc::now();
                if let Err(err) = sqlx::query(queries::BACKFILL_LAST_RESET_TIME)
                    .bind(trader_id)
                    .bind(now)
                    .execute(&self.pool)
                    .await
                {
                    tracing::warn!(trader_id, error = %err, "failed to back-fill last_reset_time");
                }
                now
            }
        };

        Ok(Some(RiskState {
            trader_id: row.try_get("trader_id")?,
            daily_pnl: row.try_get("daily_pnl")?,
            drawdown_pct: row.try_get("drawdown_pct")?,
            current_equity: row.try_get("current_equity")?,
            peak_equity: row.try_get("peak_equity")?,
            trading_paused: row.try_get("trading_paused")?,
            paused_until: row.try_get("paused_until")?,
            last_reset_time,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

/// Bridges the in-memory store's synchronous persist hook to this worker's
/// async queue: every committed mutation gets enqueued as a snapshot.
pub struct QueuePersistHook {
    worker: Arc<PersistenceWorker>,
}

impl QueuePersistHook {
    pub fn new(worker: Arc<PersistenceWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl PersistHook for QueuePersistHook {
    async fn persist(&self, trader_id: &str, snapshot: &RiskState) -> RiskResult<()> {
        self.worker
            .save(trader_id, snapshot.clone(), None, None)
            .await
    }
}

async fn connect_with_retries(database_url: &str, max_attempts: u32) -> RiskResult<PgPool> {
    use sqlx::postgres::PgPoolOptions;

    let mut attempt = 0u32;
    loop {
        match PgPoolOptions::new()
            .max_connections(30)
            .acquire_timeout(StdDuration::from_secs(30))
            .connect(database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(err) if attempt + 1 < max_attempts => {
                attempt += 1;
                let backoff = StdDuration::from_secs(1 << attempt);
                tracing::warn!(attempt, error = %err, "database connection failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn run_consumer(
    pool: PgPool,
    mut rx: mpsc::Receiver<QueueItem>,
    config: PersistenceConfig,
    metrics: Arc<PersistenceMetrics>,
) {
    let mut buffer = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= config.batch_size {
                            flush(&pool, &mut buffer, &config, &metrics).await;
                        }
                    }
                    None => {
                        flush(&pool, &mut buffer, &config, &metrics).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&pool, &mut buffer, &config, &metrics).await;
                }
            }
        }
    }
}

async fn flush(
    pool: &PgPool,
    buffer: &mut Vec<QueueItem>,
    config: &PersistenceConfig,
    metrics: &Arc<PersistenceMetrics>,
) {
    if buffer.is_empty() {
        return;
    }
    let items = std::mem::take(buffer);
    let ops = coalesce(items);
    let op_count = ops.iter().map(trace_count).sum::<usize>().max(1);

    let mut attempt = 0u32;
    loop {
        match commit_batch(pool, &ops).await {
            Ok(()) => {
                metrics
                    .batches_committed
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) if attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    batch_size = ops.len(),
                    error = %err,
                    "batch commit failed, retrying"
                );
                tokio::time::sleep(backoff_with_jitter(
                    attempt,
                    config.backoff_base,
                    config.backoff_cap,
                ))
                .await;
            }
            Err(err) => {
                tracing::error!(
                    batch_size = ops.len(),
                    error = %err,
                    "batch commit exhausted retries, dropping batch"
                );
                metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
                metrics
                    .operations_dropped
                    .fetch_add(op_count as u64, Ordering::Relaxed);
                return;
            }
        }
    }
}

fn trace_count(op: &Operation) -> usize {
    match op {
        Operation::Snapshot(_) => 1,
        Operation::Delta { trace_ids, .. } => trace_ids.len().max(1),
    }
}

/// Coalesces consecutive same-trader deltas into one operation; a snapshot
/// always terminates the current coalesced group and stands alone, per the
/// ordering guarantee in §4.4.
fn coalesce(items: Vec<QueueItem>) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut pending: Option<(String, Delta, Vec<String>)> = None;

    for item in items {
        match item {
            QueueItem::Snapshot(s) => {
                if let Some((trader_id, delta, trace_ids)) = pending.take() {
                    ops.push(Operation::Delta {
                        trader_id,
                        delta,
                        trace_ids,
                    });
                }
                ops.push(Operation::Snapshot(s));
            }
            QueueItem::Delta(d) => match &mut pending {
                Some((trader_id, delta, trace_ids)) if *trader_id == d.trader_id => {
                    if let Some(trace_id) = d.delta.trace_id.clone() {
                        trace_ids.push(trace_id);
                    }
                    *delta = std::mem::take(delta).compose(d.delta);
                }
                _ => {
                    if let Some((trader_id, delta, trace_ids)) = pending.take() {
                        ops.push(Operation::Delta {
                            trader_id,
                            delta,
                            trace_ids,
                        });
                    }
                    let trace_ids = d.delta.trace_id.clone().into_iter().collect();
                    pending = Some((d.trader_id, d.delta, trace_ids));
                }
            },
        }
    }
    if let Some((trader_id, delta, trace_ids)) = pending.take() {
        ops.push(Operation::Delta {
            trader_id,
            delta,
            trace_ids,
        });
    }
    ops
}

async fn commit_batch(pool: &PgPool, ops: &[Operation]) -> RiskResult<()> {
    let mut tx = pool.begin().await?;
    for op in ops {
        match op {
            Operation::Snapshot(s) => commit_snapshot_tx(&mut tx, s).await?,
            Operation::Delta {
                trader_id,
                delta,
                trace_ids,
            } => {
                let trace_id = trace_ids.join(",");
                let reason = delta.reason.clone().unwrap_or_default();
                commit_delta_tx(&mut tx, trader_id, delta, &trace_id, &reason).await?
            }
        }
    }
    tx.commit().await?;
    Ok(())
}

async fn commit_snapshot_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    s: &SnapshotSubmission,
) -> RiskResult<()> {
    sqlx::query(queries::UPSERT_SNAPSHOT)
        .bind(&s.trader_id)
        .bind(s.snapshot.daily_pnl)
        .bind(s.snapshot.drawdown_pct)
        .bind(s.snapshot.current_equity)
        .bind(s.snapshot.peak_equity)
        .bind(s.snapshot.trading_paused)
        .bind(s.snapshot.paused_until)
        .bind(s.snapshot.last_reset_time)
        .bind(s.snapshot.updated_at)
        .fetch_one(&mut **tx)
        .await?;

    sqlx::query(queries::INSERT_HISTORY)
        .bind(&s.trader_id)
        .bind(&s.trace_id)
        .bind(&s.reason)
        .bind(s.snapshot.daily_pnl)
        .bind(s.snapshot.drawdown_pct)
        .bind(s.snapshot.current_equity)
        .bind(s.snapshot.peak_equity)
        .bind(s.snapshot.trading_paused)
        .bind(s.snapshot.paused_until)
        .bind(s.snapshot.last_reset_time)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn commit_delta_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    trader_id: &str,
    delta: &Delta,
    trace_id: &str,
    reason: &str,
) -> RiskResult<()> {
    let drawdown: SetMarker<f64> = delta.drawdown_pct;
    let paused: SetMarker<bool> = delta.trading_paused;
    let paused_until: SetMarker<Option<DateTime<Utc>>> = delta.paused_until;
    let last_reset: SetMarker<Option<DateTime<Utc>>> = delta.last_reset_time;

    sqlx::query(queries::UPSERT_DELTA)
        .bind(trader_id)
        .bind(delta.delta_daily_pnl)
        .bind(delta.delta_equity)
        .bind(drawdown.set)
        .bind(drawdown.value)
        .bind(paused.set)
        .bind(paused.value)
        .bind(paused_until.set)
        .bind(paused_until.value)
        .bind(last_reset.set)
        .bind(last_reset.value)
        .bind(trace_id)
        .bind(reason)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn commit_delta(
    pool: &PgPool,
    trader_id: &str,
    delta: &Delta,
    trace_id: &str,
    reason: &str,
) -> Result<(), sqlx::Error> {
    let drawdown: SetMarker<f64> = delta.drawdown_pct;
    let paused: SetMarker<bool> = delta.trading_paused;
    let paused_until: SetMarker<Option<DateTime<Utc>>> = delta.paused_until;
    let last_reset: SetMarker<Option<DateTime<Utc>>> = delta.last_reset_time;

    sqlx::query(queries::UPSERT_DELTA)
        .bind(trader_id)
        .bind(delta.delta_daily_pnl)
        .bind(delta.delta_equity)
        .bind(drawdown.set)
        .bind(drawdown.value)
        .bind(paused.set)
        .bind(paused.value)
        .bind(paused_until.set)
        .bind(paused_until.value)
        .bind(last_reset.set)
        .bind(last_reset.value)
        .bind(trace_id)
        .bind(reason)
        .execute(pool)
        .await?;
    Ok(())
}

/// `base * 2^(attempt-1)`, capped, then inflated by up to 50% jitter.
fn backoff_with_jitter(attempt: u32, base: StdDuration, cap: StdDuration) -> StdDuration {
    let exp_ms = (base.as_millis() as u64).saturating_mul(1u64 << attempt.saturating_sub(1).min(32));
    let capped_ms = exp_ms.min(cap.as_millis() as u64);
    let jitter = rand::random::<f64>() * 0.5;
    StdDuration::from_millis((capped_ms as f64 * (1.0 + jitter)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::types::SetMarker;

    fn delta(daily: f64, equity: f64) -> Delta {
        Delta {
            delta_daily_pnl: daily,
            delta_equity: equity,
            ..Default::default()
        }
    }

    #[test]
    fn coalesce_merges_consecutive_same_trader_deltas() {
        let items = vec![
            QueueItem::Delta(DeltaSubmission {
                trader_id: "T1".into(),
                delta: delta(1.0, 2.0),
            }),
            QueueItem::Delta(DeltaSubmission {
                trader_id: "T1".into(),
                delta: delta(3.0, 4.0),
            }),
        ];
        let ops = coalesce(items);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Operation::Delta { delta, .. } => {
                assert_eq!(delta.delta_daily_pnl, 4.0);
                assert_eq!(delta.delta_equity, 6.0);
            }
            _ => panic!("expected delta op"),
        }
    }

    #[test]
    fn snapshot_terminates_coalescing_group() {
        let now = Utc::now();
        let items = vec![
            QueueItem::Delta(DeltaSubmission {
                trader_id: "T1".into(),
                delta: delta(1.0, 1.0),
            }),
            QueueItem::Snapshot(SnapshotSubmission {
                trader_id: "T1".into(),
                snapshot: RiskState::new("T1", now),
                trace_id: "trace".into(),
                reason: "reason".into(),
            }),
            QueueItem::Delta(DeltaSubmission {
                trader_id: "T1".into(),
                delta: delta(2.0, 2.0),
            }),
        ];
        let ops = coalesce(items);
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[1], Operation::Snapshot(_)));
    }

    #[test]
    fn different_traders_do_not_merge() {
        let items = vec![
            QueueItem::Delta(DeltaSubmission {
                trader_id: "T1".into(),
                delta: delta(1.0, 1.0),
            }),
            QueueItem::Delta(DeltaSubmission {
                trader_id: "T2".into(),
                delta: delta(1.0, 1.0),
            }),
        ];
        let ops = coalesce(items);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        let base = StdDuration::from_millis(100);
        let cap = StdDuration::from_millis(500);
        let d1 = backoff_with_jitter(1, base, cap);
        let d5 = backoff_with_jitter(5, base, cap);
        assert!(d1.as_millis() >= 100);
        assert!(d5.as_millis() <= 750);
    }

    #[test]
    fn set_marker_default_is_unset() {
        let marker: SetMarker<f64> = SetMarker::default();
        assert!(!marker.set);
    }
}
