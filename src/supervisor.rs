//! Supervisor gate (C5): composes the flag registry, store, engine, and
//! persistence worker into the single `CanTrade` checkpoint an automated
//! trader must pass before placing an order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::RiskResult;
use crate::exchange::ExchangeConnector;
use crate::flags::FeatureFlags;
use crate::persistence::{PersistenceWorker, QueuePersistHook};
use crate::risk::{RiskEngine, RiskStore};

#[derive(Debug, Clone, PartialEq)]
pub struct CanTradeDecision {
    pub allowed: bool,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct SupervisorMetrics {
    pub stop_loss_failures: AtomicU64,
}

impl SupervisorMetrics {
    pub fn stop_loss_failure_count(&self) -> u64 {
        self.stop_loss_failures.load(Ordering::Relaxed)
    }
}

pub struct Supervisor {
    pub flags: Arc<FeatureFlags>,
    pub store: Arc<RiskStore>,
    pub engine: Arc<RiskEngine>,
    persistence: Option<Arc<PersistenceWorker>>,
    exchange: Arc<dyn ExchangeConnector>,
    pub metrics: SupervisorMetrics,
}

impl Supervisor {
    /// Wires flags → store (with persistence hook) → engine → worker, then
    /// performs §4.5 restart recovery for `trader_id`: records
    /// `config.initial_balance` into the engine as equity, then loads the
    /// persisted snapshot (if any) over it, so a restart is indistinguishable
    /// from an uninterrupted run. A persistence connection failure at
    /// wire-up downgrades gracefully to in-memory-only operation with a
    /// warning, rather than failing construction.
    pub async fn new_with_persistence(
        config: &Config,
        trader_id: &str,
        flags: FeatureFlags,
        exchange: Arc<dyn ExchangeConnector>,
    ) -> Self {
        let flags = Arc::new(flags);
        let store = Arc::new(RiskStore::new(flags.clone()));
        let engine = Arc::new(RiskEngine::new(
            store.clone(),
            flags.clone(),
            config.default_limits,
        ));

        let persistence = match PersistenceWorker::connect(
            &config.database_url,
            config.persistence_config(),
        )
        .await
        {
            Ok(worker) => {
                store
                    .set_persist_func(Arc::new(QueuePersistHook::new(worker.clone())))
                    .await;
                Some(worker)
            }
            Err(err) => {
                tracing::warn!(error = %err, "persistence unavailable, running in-memory-only");
                None
            }
        };

        let supervisor = Self {
            flags,
            store,
            engine,
            persistence,
            exchange,
            metrics: SupervisorMetrics::default(),
        };

        let now = Utc::now();
        supervisor
            .store
            .record_equity(trader_id, config.initial_balance, now)
            .await;
        if let Err(err) = supervisor.recover(trader_id, now).await {
            tracing::warn!(error = %err, trader_id, "restart recovery failed, continuing with in-memory state");
        }

        supervisor
    }

    #[cfg(test)]
    fn new_in_memory(flags: FeatureFlags, limits: crate::risk::Limits, exchange: Arc<dyn ExchangeConnector>) -> Self {
        let flags = Arc::new(flags);
        let store = Arc::new(RiskStore::new(flags.clone()));
        let engine = Arc::new(RiskEngine::new(store.clone(), flags.clone(), limits));
        Self {
            flags,
            store,
            engine,
            persistence: None,
            exchange,
            metrics: SupervisorMetrics::default(),
        }
    }

    /// Restart recovery (§4.5): loads the persisted snapshot for `trader_id`
    /// and replays it into the store so a restart is indistinguishable from
    /// an uninterrupted run for subsequent `can_trade` calls.
    pub async fn recover(&self, trader_id: &str, now: DateTime<Utc>) -> RiskResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        if let Some(state) = persistence.load(trader_id).await? {
            self.store.rehydrate(state).await;
        } else {
            self.store.snapshot(trader_id, now).await;
        }
        Ok(())
    }

    /// `(false, reason)` while a pause deadline has not elapsed; otherwise
    /// re-evaluates limits against the current snapshot. On breach, logs
    /// the exact phrase `RISK LIMIT BREACHED [<name>]: <reason>`, pauses
    /// the store, and increments the breach counter.
    pub async fn can_trade(&self, trader_id: &str, now: DateTime<Utc>) -> CanTradeDecision {
        if !self.flags.enable_risk_enforcement() {
            return CanTradeDecision {
                allowed: true,
                reason: String::new(),
            };
        }

        let (paused, until) = self.store.trading_status(trader_id, now).await;
        if paused {
            if let Some(until) = until {
                if now < until {
                    return CanTradeDecision {
                        allowed: false,
                        reason: format!("paused until {until}"),
                    };
                }
            }
        }

        let state = self.store.snapshot(trader_id, now).await;
        let (breached, reason) = self.engine.check_limits(&state);
        if !breached {
            return CanTradeDecision {
                allowed: true,
                reason: String::new(),
            };
        }

        tracing::error!("RISK LIMIT BREACHED [{trader_id}]: {reason}");
        let duration = self.engine.calculate_stop_duration();
        self.store
            .set_trading_paused(trader_id, true, Some(now + duration), now)
            .await;
        self.engine.metrics.breaches.fetch_add(1, Ordering::Relaxed);

        CanTradeDecision {
            allowed: false,
            reason,
        }
    }

    /// The single per-cycle entry point (§4.5.2): applies the realized PnL
    /// delta, records equity, then returns the `can_trade` verdict, in that
    /// order, matching the data-flow diagram exactly.
    pub async fn tick(
        &self,
        trader_id: &str,
        equity: f64,
        realized_pnl_delta: f64,
        now: DateTime<Utc>,
    ) -> CanTradeDecision {
        self.store
            .update_daily_pnl(trader_id, realized_pnl_delta, now)
            .await;
        self.store.record_equity(trader_id, equity, now).await;
        self.can_trade(trader_id, now).await
    }

    /// Guarded stop-loss policy (flag-gated): forbids opening a position
    /// unless a stop-loss value is supplied and successfully placed. On
    /// placement failure, cancels all working protective orders for the
    /// symbol to avoid orphaning the position, and counts the failure.
    pub async fn open_position_guarded(
        &self,
        symbol: &str,
        quantity: f64,
        stop_loss: Option<f64>,
    ) -> RiskResult<()> {
        if !self.flags.enable_guarded_stop_loss() {
            return self.exchange.open_long(symbol, quantity).await;
        }

        let Some(stop_loss) = stop_loss else {
            return Err(crate::error::RiskError::Validation(
                "guarded stop-loss policy requires a stop-loss price".into(),
            ));
        };

        self.exchange.open_long(symbol, quantity).await?;
        if let Err(err) = self.exchange.set_stop_loss(symbol, stop_loss).await {
            self.metrics
                .stop_loss_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(symbol, error = %err, "stop-loss placement failed, cancelling working orders");
            self.exchange.cancel_all_orders(symbol).await?;
            return Err(err);
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::NullExchange;
    use crate::flags::FeatureFlagState;
    use crate::risk::Limits;

    fn supervisor(limits: Limits, enforcement: bool) -> Supervisor {
        let flags = FeatureFlagState {
            enable_risk_enforcement: enforcement,
            enable_mutex_protection: true,
            enable_guarded_stop_loss: true,
            ..Default::default()
        };
        Supervisor::new_in_memory(
            FeatureFlags::new(flags),
            limits,
            Arc::new(NullExchange::new()),
        )
    }

    #[tokio::test]
    async fn can_trade_allows_when_enforcement_disabled() {
        let supervisor = supervisor(Limits::default(), false);
        let decision = supervisor.can_trade("T1", Utc::now()).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn tick_pauses_trading_on_breach_and_blocks_can_trade() {
        let limits = Limits {
            max_daily_loss: 100.0,
            max_drawdown: 0.0,
            stop_trading_minutes: 10,
        };
        let supervisor = supervisor(limits, true);
        let now = Utc::now();
        supervisor.store.record_equity("T1", 1000.0, now).await;

        let decision = supervisor.tick("T1", 1000.0, -150.0, now).await;
        assert!(!decision.allowed);
        assert_eq!(supervisor.engine.metrics.breach_count(), 1);

        let second = supervisor.can_trade("T1", now).await;
        assert!(!second.allowed);
    }

    #[tokio::test]
    async fn guarded_stop_loss_requires_price() {
        let supervisor = supervisor(Limits::default(), true);
        let result = supervisor
            .open_position_guarded("BTC-USD", 1.0, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn guarded_stop_loss_cancels_orders_on_placement_failure() {
        let flags = FeatureFlagState {
            enable_risk_enforcement: true,
            enable_mutex_protection: true,
            enable_guarded_stop_loss: true,
            ..Default::default()
        };
        let exchange = Arc::new(NullExchange::failing_stop_loss());
        let supervisor = Supervisor::new_in_memory(
            FeatureFlags::new(flags),
            Limits::default(),
            exchange.clone(),
        );

        let result = supervisor
            .open_position_guarded("BTC-USD", 1.0, Some(90.0))
            .await;
        assert!(result.is_err());
        assert_eq!(supervisor.metrics.stop_loss_failure_count(), 1);
        let calls = exchange.calls.lock().await;
        assert!(calls.contains(&"cancel_all_orders:BTC-USD".to_string()));
    }
}
