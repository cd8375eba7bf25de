//! Risk engine (C3): a stateless policy layer over the store. `CheckLimits`
//! is a pure function of a passed-in snapshot; everything else composes it
//! with the store to decide whether to pause trading.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::flags::FeatureFlags;
use crate::risk::store::RiskStore;
use crate::risk::types::{drawdown_pct, Limits, RiskState};

#[derive(Debug, Clone, PartialEq)]
pub struct AssessDecision {
    pub state: RiskState,
    pub breached: bool,
    pub reason: String,
    pub newly_paused: bool,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub breaches: AtomicU64,
}

impl EngineMetrics {
    pub fn breach_count(&self) -> u64 {
        self.breaches.load(Ordering::Relaxed)
    }
}

pub struct RiskEngine {
    store: Arc<RiskStore>,
    flags: Arc<FeatureFlags>,
    limits: RwLock<Limits>,
    pub metrics: EngineMetrics,
}

impl RiskEngine {
    pub fn new(store: Arc<RiskStore>, flags: Arc<FeatureFlags>, limits: Limits) -> Self {
        Self {
            store,
            flags,
            limits: RwLock::new(limits.normalized()),
            metrics: EngineMetrics::default(),
        }
    }

    pub fn limits(&self) -> Limits {
        *self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_limits(&self, limits: Limits) {
        *self.limits.write().unwrap_or_else(|e| e.into_inner()) = limits.normalized();
    }

    /// Pure function of the passed-in state: evaluates daily-loss and
    /// drawdown limits in order and concatenates reasons with `"; "` when
    /// both trigger. Returns `(false, "")` when enforcement is disabled.
    pub fn check_limits(&self, state: &RiskState) -> (bool, String) {
        if !self.flags.enable_risk_enforcement() {
            return (false, String::new());
        }
        let limits = self.limits();
        let mut reasons = Vec::new();

        if limits.max_daily_loss > 0.0 && state.daily_pnl <= -limits.max_daily_loss {
            reasons.push(format!(
                "daily pnl {:.2} \u{2264} limit -{:.2}",
                state.daily_pnl, limits.max_daily_loss
            ));
        }

        if limits.max_drawdown > 0.0 && state.peak_equity > 0.0 {
            let drawdown = drawdown_pct(state.peak_equity, state.current_equity);
            if drawdown >= limits.max_drawdown {
                reasons.push(format!(
                    "drawdown {:.2}% \u{2265} limit {:.2}%",
                    drawdown, limits.max_drawdown
                ));
            }
        }

        if reasons.is_empty() {
            (false, String::new())
        } else {
            (true, reasons.join("; "))
        }
    }

    /// `stop_trading_minutes` minutes, defaulting to 30 when the configured
    /// limit is zero or negative.
    pub fn calculate_stop_duration(&self) -> Duration {
        let minutes = self.limits().stop_trading_minutes;
        let minutes = if minutes <= 0 {
            crate::risk::types::DEFAULT_STOP_TRADING_MINUTES
        } else {
            minutes
        };
        Duration::minutes(minutes)
    }

    /// Records `equity` into the store, checks limits, and pauses trading
    /// on breach. Already-paused traders short-circuit without
    /// re-evaluating limits.
    pub async fn assess(&self, trader_id: &str, equity: f64, now: DateTime<Utc>) -> AssessDecision {
        self.store.record_equity(trader_id, equity, now).await;
        let state = self.store.snapshot(trader_id, now).await;

        if state.trading_paused {
            if let Some(until) = state.paused_until {
                if now < until {
                    return AssessDecision {
                        state,
                        breached: false,
                        reason: String::new(),
                        newly_paused: false,
                    };
                }
            }
        }

        let (breached, reason) = self.check_limits(&state);
        if breached && self.flags.enable_risk_enforcement() {
            let duration = self.calculate_stop_duration();
            let paused_state = self
                .store
                .set_trading_paused(trader_id, true, Some(now + duration), now)
                .await;
            self.metrics.breaches.fetch_add(1, Ordering::Relaxed);
            return AssessDecision {
                state: paused_state,
                breached,
                reason,
                newly_paused: true,
            };
        }

        AssessDecision {
            state,
            breached,
            reason,
            newly_paused: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FeatureFlagState;
    use crate::risk::types::RiskState as RS;

    fn engine(limits: Limits, enforcement: bool) -> RiskEngine {
        let flags = Arc::new(FeatureFlags::new(FeatureFlagState {
            enable_mutex_protection: true,
            enable_risk_enforcement: enforcement,
            ..Default::default()
        }));
        let store = Arc::new(RiskStore::new(flags.clone()));
        RiskEngine::new(store, flags, limits)
    }

    fn state_with(daily_pnl: f64, peak: f64, current: f64) -> RS {
        let now = Utc::now();
        RS {
            trader_id: "T1".into(),
            daily_pnl,
            drawdown_pct: drawdown_pct(peak, current),
            current_equity: current,
            peak_equity: peak,
            trading_paused: false,
            paused_until: None,
            last_reset_time: now,
            updated_at: now,
        }
    }

    const LIMITS: Limits = Limits {
        max_daily_loss: 50.0,
        max_drawdown: 20.0,
        stop_trading_minutes: 30,
    };

    #[test]
    fn breaches_on_daily_loss() {
        let engine = engine(LIMITS, true);
        let (breached, reason) = engine.check_limits(&state_with(-50.0, 1000.0, 950.0));
        assert!(breached);
        assert!(reason.contains("daily pnl"));
    }

    #[test]
    fn breaches_on_drawdown() {
        let engine = engine(LIMITS, true);
        let (breached, reason) = engine.check_limits(&state_with(-10.0, 1000.0, 800.0));
        assert!(breached);
        assert!(reason.contains("drawdown"));
    }

    #[test]
    fn no_breach_within_limits() {
        let engine = engine(LIMITS, true);
        let (breached, _) = engine.check_limits(&state_with(-30.0, 1000.0, 970.0));
        assert!(!breached);
    }

    #[test]
    fn enforcement_disabled_never_breaches() {
        let engine = engine(LIMITS, false);
        let (breached, reason) = engine.check_limits(&state_with(-1000.0, 1000.0, 1.0));
        assert!(!breached);
        assert_eq!(reason, "");
    }

    #[test]
    fn both_reasons_concatenated() {
        let engine = engine(LIMITS, true);
        let (breached, reason) = engine.check_limits(&state_with(-60.0, 1000.0, 700.0));
        assert!(breached);
        assert!(reason.contains("daily pnl"));
        assert!(reason.contains("drawdown"));
        assert!(reason.contains("; "));
    }

    #[test]
    fn stop_duration_defaults_when_non_positive() {
        let engine = engine(
            Limits {
                stop_trading_minutes: 0,
                ..LIMITS
            },
            true,
        );
        assert_eq!(
            engine.calculate_stop_duration(),
            Duration::minutes(crate::risk::types::DEFAULT_STOP_TRADING_MINUTES)
        );
    }

    #[tokio::test]
    async fn assess_pauses_trading_on_breach() {
        let engine = engine(
            Limits {
                max_daily_loss: 100.0,
                max_drawdown: 50.0,
                stop_trading_minutes: 1,
            },
            true,
        );
        let now = Utc::now();
        engine
            .store
            .update_daily_pnl("T1", -150.0, now)
            .await;

        let decision = engine.assess("T1", 900.0, now).await;
        assert!(decision.breached);
        assert!(decision.newly_paused);
        assert!(decision.reason.contains("daily pnl"));
        assert_eq!(engine.metrics.breach_count(), 1);
    }

    #[tokio::test]
    async fn assess_short_circuits_while_still_paused() {
        let engine = engine(LIMITS, true);
        let now = Utc::now();
        engine
            .store
            .set_trading_paused("T1", true, Some(now + Duration::minutes(5)), now)
            .await;

        let decision = engine.assess("T1", 1000.0, now).await;
        assert!(!decision.breached);
        assert!(!decision.newly_paused);
    }
}
