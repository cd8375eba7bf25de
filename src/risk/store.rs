//! In-memory per-trader risk store (C2).
//!
//! Every public operation is a `mutate-and-snapshot`: take the per-trader
//! lock (when mutex protection is enabled), apply the change, capture the
//! snapshot while still holding the lock, release, then run telemetry and
//! the persistence hook outside the lock. The top-level map uses a single
//! coarse lock only to insert a trader's row for the first time; established
//! rows are mutated under their own lock so concurrent traders never
//! contend with each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::RiskResult;
use crate::flags::FeatureFlags;
use crate::risk::types::RiskState;

/// Write-through hook installed by the supervisor post-construction. Held
/// as a plain `Arc`, never a strong back-reference to the supervisor
/// itself, so store → persistence → supervisor never forms a cycle.
#[async_trait]
pub trait PersistHook: Send + Sync {
    async fn persist(&self, trader_id: &str, snapshot: &RiskState) -> RiskResult<()>;
}

#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub data_race_mutations: AtomicU64,
    pub persist_hook_failures: AtomicU64,
    pub pause_auto_expirations: AtomicU64,
}

impl StoreMetrics {
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            data_race_mutations: self.data_race_mutations.load(Ordering::Relaxed),
            persist_hook_failures: self.persist_hook_failures.load(Ordering::Relaxed),
            pause_auto_expirations: self.pause_auto_expirations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub data_race_mutations: u64,
    pub persist_hook_failures: u64,
    pub pause_auto_expirations: u64,
}

struct TraderRow {
    state: Mutex<RiskState>,
}

pub struct RiskStore {
    flags: Arc<FeatureFlags>,
    rows: RwLock<HashMap<String, Arc<TraderRow>>>,
    persist_hook: RwLock<Option<Arc<dyn PersistHook>>>,
    pub metrics: StoreMetrics,
}

impl RiskStore {
    pub fn new(flags: Arc<FeatureFlags>) -> Self {
        Self {
            flags,
            rows: RwLock::new(HashMap::new()),
            persist_hook: RwLock::new(None),
            metrics: StoreMetrics::default(),
        }
    }

    /// Installs the persistence write-through hook. At most one hook is
    /// ever active; a later call replaces an earlier one.
    pub async fn set_persist_func(&self, hook: Arc<dyn PersistHook>) {
        *self.persist_hook.write().await = Some(hook);
    }

    async fn row_for(&self, trader_id: &str, now: DateTime<Utc>) -> Arc<TraderRow> {
        if let Some(row) = self.rows.read().await.get(trader_id) {
            return row.clone();
        }
        let mut rows = self.rows.write().await;
        rows.entry(trader_id.to_string())
            .or_insert_with(|| {
                Arc::new(TraderRow {
                    state: Mutex::new(RiskState::new(trader_id, now)),
                })
            })
            .clone()
    }

    /// Runs `mutate` against the trader's row, honoring the current mutex
    /// setting, and returns the post-mutation snapshot. When protection is
    /// disabled the read and the write happen as two separate critical
    /// sections instead of one, reproducing the legacy lost-update race
    /// without reaching for `unsafe`; `data_race_mutations` is incremented
    /// every time this path runs.
    async fn mutate_and_snapshot(
        &self,
        trader_id: &str,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut RiskState) + Send,
    ) -> RiskState {
        let row = self.row_for(trader_id, now).await;
        let protected = self.flags.enable_mutex_protection();

        let snapshot = if protected {
            let mut state = row.state.lock().await;
            mutate(&mut state);
            state.clone()
        } else {
            self.metrics
                .data_race_mutations
                .fetch_add(1, Ordering::Relaxed);
            let mut state = row.state.lock().await.clone();
            mutate(&mut state);
            *row.state.lock().await = state.clone();
            state
        };

        self.run_persist_hook(trader_id, &snapshot).await;
        snapshot
    }

    async fn run_persist_hook(&self, trader_id: &str, snapshot: &RiskState) {
        if !self.flags.enable_persistence() {
            return;
        }
        let hook = self.persist_hook.read().await.clone();
        if let Some(hook) = hook {
            if let Err(err) = hook.persist(trader_id, snapshot).await {
                self.metrics
                    .persist_hook_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(trader_id, error = %err, "persistence hook failed");
            }
        }
    }

    /// Adds `delta` to `daily_pnl`; resets to 0 first if 24h have elapsed
    /// since the last reset.
    pub async fn update_daily_pnl(&self, trader_id: &str, delta: f64, now: DateTime<Utc>) -> f64 {
        let snapshot = self
            .mutate_and_snapshot(trader_id, now, |state| {
                if needs_daily_reset(state.last_reset_time, now) {
                    state.daily_pnl = 0.0;
                    state.last_reset_time = now;
                }
                state.daily_pnl += delta;
                state.updated_at = now;
            })
            .await;
        snapshot.daily_pnl
    }

    /// Resets `daily_pnl` when 24h have elapsed since the last reset.
    /// Returns whether a reset happened.
    pub async fn reset_daily_pnl_if_needed(&self, trader_id: &str, now: DateTime<Utc>) -> bool {
        let row = self.row_for(trader_id, now).await;
        let protected = self.flags.enable_mutex_protection();
        let mut did_reset = false;

        let run = |state: &mut RiskState, did_reset: &mut bool| {
            if needs_daily_reset(state.last_reset_time, now) {
                state.daily_pnl = 0.0;
                state.last_reset_time = now;
                state.updated_at = now;
                *did_reset = true;
            }
        };

        let snapshot = if protected {
            let mut state = row.state.lock().await;
            run(&mut state, &mut did_reset);
            state.clone()
        } else {
            self.metrics
                .data_race_mutations
                .fetch_add(1, Ordering::Relaxed);
            let mut state = row.state.lock().await.clone();
            run(&mut state, &mut did_reset);
            *row.state.lock().await = state.clone();
            state
        };

        if did_reset {
            self.run_persist_hook(trader_id, &snapshot).await;
        }
        did_reset
    }

    /// Sets `current_equity`, lifts `peak_equity` to the max, and
    /// recomputes `drawdown_pct`. Returns the resulting drawdown.
    pub async fn record_equity(&self, trader_id: &str, equity: f64, now: DateTime<Utc>) -> f64 {
        let snapshot = self
            .mutate_and_snapshot(trader_id, now, |state| {
                state.current_equity = equity;
                state.peak_equity = state.peak_equity.max(equity);
                state.recompute_drawdown();
                state.updated_at = now;
            })
            .await;
        snapshot.drawdown_pct
    }

    /// Replaces the pause fields outright.
    pub async fn set_trading_paused(
        &self,
        trader_id: &str,
        paused: bool,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RiskState {
        self.mutate_and_snapshot(trader_id, now, |state| {
            state.trading_paused = paused;
            state.paused_until = until;
            state.updated_at = now;
        })
        .await
    }

    /// If paused and the deadline has passed, auto-clears the pause and
    /// reports the cleared state; otherwise reports the current status.
    pub async fn trading_status(
        &self,
        trader_id: &str,
        now: DateTime<Utc>,
    ) -> (bool, Option<DateTime<Utc>>) {
        let row = self.row_for(trader_id, now).await;
        let protected = self.flags.enable_mutex_protection();

        let expired = {
            let state = row.state.lock().await;
            state.trading_paused && state.paused_until.map(|until| now > until).unwrap_or(false)
        };

        if !expired {
            let state = row.state.lock().await;
            return (state.trading_paused, state.paused_until);
        }

        let snapshot = if protected {
            let mut state = row.state.lock().await;
            state.trading_paused = false;
            state.paused_until = None;
            state.updated_at = now;
            state.clone()
        } else {
            self.metrics
                .data_race_mutations
                .fetch_add(1, Ordering::Relaxed);
            let mut state = row.state.lock().await.clone();
            state.trading_paused = false;
            state.paused_until = None;
            state.updated_at = now;
            *row.state.lock().await = state.clone();
            state
        };

        self.metrics
            .pause_auto_expirations
            .fetch_add(1, Ordering::Relaxed);
        self.run_persist_hook(trader_id, &snapshot).await;
        (false, None)
    }

    /// Consistent read of a trader's current snapshot.
    pub async fn snapshot(&self, trader_id: &str, now: DateTime<Utc>) -> RiskState {
        let row = self.row_for(trader_id, now).await;
        row.state.lock().await.clone()
    }

    /// Rehydrates an in-memory row from a persisted snapshot, bypassing the
    /// persistence hook (used only during supervisor startup recovery).
    pub async fn rehydrate(&self, state: RiskState) {
        let mut rows = self.rows.write().await;
        rows.insert(
            state.trader_id.clone(),
            Arc::new(TraderRow {
                state: Mutex::new(state),
            }),
        );
    }
}

fn needs_daily_reset(last_reset_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_reset_time) >= chrono::Duration::hours(24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn flags(mutex_protection: bool) -> Arc<FeatureFlags> {
        Arc::new(FeatureFlags::new(crate::flags::FeatureFlagState {
            enable_mutex_protection: mutex_protection,
            enable_persistence: false,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn record_equity_lifts_peak_and_computes_drawdown() {
        let store = RiskStore::new(flags(true));
        let now = Utc::now();

        store.record_equity("T1", 1000.0, now).await;
        let drawdown = store.record_equity("T1", 800.0, now).await;

        assert!((drawdown - 20.0).abs() < 1e-9);
        let snap = store.snapshot("T1", now).await;
        assert_eq!(snap.peak_equity, 1000.0);
        assert_eq!(snap.current_equity, 800.0);
    }

    #[tokio::test]
    async fn record_equity_never_lowers_peak() {
        let store = RiskStore::new(flags(true));
        let now = Utc::now();
        store.record_equity("T1", 1000.0, now).await;
        store.record_equity("T1", 1200.0, now).await;
        store.record_equity("T1", 900.0, now).await;

        let snap = store.snapshot("T1", now).await;
        assert_eq!(snap.peak_equity, 1200.0);
    }

    #[tokio::test]
    async fn daily_reset_fires_after_24_hours() {
        let store = RiskStore::new(flags(true));
        let t0 = Utc::now();
        store.update_daily_pnl("T1", 50.0, t0).await;

        let before = store.snapshot("T1", t0).await;
        assert_eq!(before.daily_pnl, 50.0);

        let t1 = t0 + Duration::hours(24);
        let did_reset = store.reset_daily_pnl_if_needed("T1", t1).await;
        assert!(did_reset);

        let after = store.snapshot("T1", t1).await;
        assert_eq!(after.daily_pnl, 0.0);
        assert_eq!(after.last_reset_time, t1);
    }

    #[tokio::test]
    async fn reset_does_not_fire_before_24_hours() {
        let store = RiskStore::new(flags(true));
        let t0 = Utc::now();
        store.update_daily_pnl("T1", 50.0, t0).await;

        let t1 = t0 + Duration::hours(23);
        let did_reset = store.reset_daily_pnl_if_needed("T1", t1).await;
        assert!(!did_reset);
    }

    #[tokio::test]
    async fn trading_status_auto_expires_pause() {
        let store = RiskStore::new(flags(true));
        let now = Utc::now();
        store
            .set_trading_paused("T1", true, Some(now + Duration::minutes(5)), now)
            .await;

        let later = now + Duration::minutes(6);
        let (paused, until) = store.trading_status("T1", later).await;
        assert!(!paused);
        assert!(until.is_none());
        assert_eq!(store.metrics.snapshot().pause_auto_expirations, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_sum_exactly_with_mutex_protection() {
        let store = Arc::new(RiskStore::new(flags(true)));
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.update_daily_pnl("T2", 1.0, now).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = store.snapshot("T2", now).await;
        assert_eq!(snap.daily_pnl, 500.0);
    }

    #[tokio::test]
    async fn unprotected_mode_counts_data_race_mutations() {
        let store = RiskStore::new(flags(false));
        let now = Utc::now();
        store.update_daily_pnl("T1", 1.0, now).await;
        store.update_daily_pnl("T1", 1.0, now).await;
        assert_eq!(store.metrics.snapshot().data_race_mutations, 2);
    }
}
