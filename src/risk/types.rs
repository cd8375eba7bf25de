//! Shared data model (§3): the per-trader snapshot, the append-only
//! transition row, the composable delta, and the guard-rail limits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A consistent, read-only view of a trader's risk state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub trader_id: String,
    pub daily_pnl: f64,
    pub drawdown_pct: f64,
    pub current_equity: f64,
    pub peak_equity: f64,
    pub trading_paused: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub last_reset_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RiskState {
    /// A freshly-touched trader: zero everything, reset clock started now.
    pub fn new(trader_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            trader_id: trader_id.into(),
            daily_pnl: 0.0,
            drawdown_pct: 0.0,
            current_equity: 0.0,
            peak_equity: 0.0,
            trading_paused: false,
            paused_until: None,
            last_reset_time: now,
            updated_at: now,
        }
    }

    pub fn recompute_drawdown(&mut self) {
        self.drawdown_pct = drawdown_pct(self.peak_equity, self.current_equity);
    }
}

/// `max(0, (peak - current) / peak * 100)`, or 0 when `peak <= 0`.
pub fn drawdown_pct(peak_equity: f64, current_equity: f64) -> f64 {
    if peak_equity <= 0.0 {
        return 0.0;
    }
    ((peak_equity - current_equity) / peak_equity * 100.0).max(0.0)
}

/// Append-only audit row mirroring a committed `RiskState` plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskStateTransition {
    pub trader_id: String,
    pub daily_pnl: f64,
    pub drawdown_pct: f64,
    pub current_equity: f64,
    pub peak_equity: f64,
    pub trading_paused: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub last_reset_time: DateTime<Utc>,
    pub trace_id: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// `{set: bool, value: T}` — whether a delta intends to overwrite a field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetMarker<T> {
    pub set: bool,
    pub value: T,
}

impl<T: Default> Default for SetMarker<T> {
    fn default() -> Self {
        Self {
            set: false,
            value: T::default(),
        }
    }
}

impl<T> SetMarker<T> {
    pub fn set(value: T) -> Self {
        Self { set: true, value }
    }

    pub fn unset() -> Self
    where
        T: Default,
    {
        Self::default()
    }
}

/// A composable incremental change to a `RiskState` (§3, §4.4). Deltas
/// compose: additive fields sum, set-markers take the latest setter,
/// `updated_at` takes the max, reasons concatenate with `"; "`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    pub delta_daily_pnl: f64,
    pub delta_equity: f64,
    pub drawdown_pct: SetMarker<f64>,
    pub trading_paused: SetMarker<bool>,
    pub paused_until: SetMarker<Option<DateTime<Utc>>>,
    pub last_reset_time: SetMarker<Option<DateTime<Utc>>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub reason: Option<String>,
}

impl Delta {
    /// Composes `self` followed by `next`, per §3's composition rule.
    pub fn compose(mut self, next: Delta) -> Delta {
        self.delta_daily_pnl += next.delta_daily_pnl;
        self.delta_equity += next.delta_equity;
        if next.drawdown_pct.set {
            self.drawdown_pct = next.drawdown_pct;
        }
        if next.trading_paused.set {
            self.trading_paused = next.trading_paused;
        }
        if next.paused_until.set {
            self.paused_until = next.paused_until;
        }
        if next.last_reset_time.set {
            self.last_reset_time = next.last_reset_time;
        }
        self.updated_at = match (self.updated_at, next.updated_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };
        self.trace_id = match (self.trace_id.take(), next.trace_id) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, None) => a,
            (None, b) => b,
        };
        self.reason = match (self.reason.take(), next.reason) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, None) => a,
            (None, b) => b,
        };
        self
    }
}

/// Guard rails evaluated by the risk engine (C3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub stop_trading_minutes: i64,
}

pub const DEFAULT_STOP_TRADING_MINUTES: i64 = 30;

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_daily_loss: 0.0,
            max_drawdown: 0.0,
            stop_trading_minutes: DEFAULT_STOP_TRADING_MINUTES,
        }
    }
}

impl Limits {
    /// Normalizes to non-negative values and fills in the default stop
    /// duration, matching the write-time normalization the engine applies
    /// on `UpdateLimits`.
    pub fn normalized(mut self) -> Self {
        if self.max_daily_loss < 0.0 {
            self.max_daily_loss = 0.0;
        }
        if self.max_drawdown < 0.0 {
            self.max_drawdown = 0.0;
        }
        if self.stop_trading_minutes <= 0 {
            self.stop_trading_minutes = DEFAULT_STOP_TRADING_MINUTES;
        }
        self
    }
}

/// Legacy percentage-based limits shim (§4.3). Converted to absolute
/// `Limits` using the trader's initial balance; round-trips idempotently
/// up to floating-point representation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub stop_trading_minutes: i64,
}

impl Parameters {
    pub fn to_limits(self, initial_balance: f64) -> Limits {
        Limits {
            max_daily_loss: self.max_daily_loss_pct / 100.0 * initial_balance,
            max_drawdown: self.max_drawdown_pct,
            stop_trading_minutes: self.stop_trading_minutes,
        }
        .normalized()
    }

    pub fn from_limits(limits: Limits, initial_balance: f64) -> Self {
        let max_daily_loss_pct = if initial_balance > 0.0 {
            limits.max_daily_loss / initial_balance * 100.0
        } else {
            0.0
        };
        Self {
            max_daily_loss_pct,
            max_drawdown_pct: limits.max_drawdown,
            stop_trading_minutes: limits.stop_trading_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawdown_zero_when_peak_zero() {
        assert_eq!(drawdown_pct(0.0, 0.0), 0.0);
    }

    #[test]
    fn drawdown_matches_formula() {
        assert!((drawdown_pct(1000.0, 800.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn delta_compose_sums_additive_fields_and_concatenates_reasons() {
        let a = Delta {
            delta_daily_pnl: 1.0,
            delta_equity: 2.0,
            reason: Some("fill-1".into()),
            ..Default::default()
        };
        let b = Delta {
            delta_daily_pnl: 3.0,
            delta_equity: 4.0,
            reason: Some("fill-2".into()),
            trading_paused: SetMarker::set(true),
            ..Default::default()
        };

        let composed = a.compose(b);
        assert_eq!(composed.delta_daily_pnl, 4.0);
        assert_eq!(composed.delta_equity, 6.0);
        assert_eq!(composed.reason.as_deref(), Some("fill-1; fill-2"));
        assert!(composed.trading_paused.set);
        assert!(composed.trading_paused.value);
    }

    #[test]
    fn delta_compose_latest_setter_wins_for_set_markers() {
        let a = Delta {
            trading_paused: SetMarker::set(true),
            ..Default::default()
        };
        let b = Delta {
            trading_paused: SetMarker::set(false),
            ..Default::default()
        };
        let composed = a.compose(b);
        assert!(composed.trading_paused.set);
        assert!(!composed.trading_paused.value);
    }

    #[test]
    fn parameters_round_trip_is_idempotent() {
        let original = Parameters {
            max_daily_loss_pct: 5.0,
            max_drawdown_pct: 20.0,
            stop_trading_minutes: 30,
        };
        let limits = original.to_limits(10_000.0);
        let back = Parameters::from_limits(limits, 10_000.0);
        assert!((back.max_daily_loss_pct - original.max_daily_loss_pct).abs() < 1e-9);
        assert_eq!(back.max_drawdown_pct, original.max_drawdown_pct);
        assert_eq!(back.stop_trading_minutes, original.stop_trading_minutes);
    }

    #[test]
    fn limits_normalize_rejects_negative_and_zero_stop_duration() {
        let limits = Limits {
            max_daily_loss: -5.0,
            max_drawdown: -1.0,
            stop_trading_minutes: 0,
        }
        .normalized();
        assert_eq!(limits.max_daily_loss, 0.0);
        assert_eq!(limits.max_drawdown, 0.0);
        assert_eq!(limits.stop_trading_minutes, DEFAULT_STOP_TRADING_MINUTES);
    }
}
