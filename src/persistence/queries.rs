//! Raw SQL for the relational schema (§6). Kept separate from the worker's
//! control flow so the statements can be read and audited on their own.

/// Upsert one `risk_state` row from a full snapshot. `peak_equity` takes the
/// max of stored and incoming, per §4.4; every other column is overwritten
/// outright.
pub const UPSERT_SNAPSHOT: &str = r#"
INSERT INTO risk_state (
    trader_id, daily_pnl, drawdown_pct, current_equity, peak_equity,
    trading_paused, paused_until, last_reset_time, updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (trader_id) DO UPDATE SET
    daily_pnl = EXCLUDED.daily_pnl,
    drawdown_pct = EXCLUDED.drawdown_pct,
    current_equity = EXCLUDED.current_equity,
    peak_equity = GREATEST(risk_state.peak_equity, EXCLUDED.peak_equity),
    trading_paused = EXCLUDED.trading_paused,
    paused_until = EXCLUDED.paused_until,
    last_reset_time = EXCLUDED.last_reset_time,
    updated_at = EXCLUDED.updated_at
RETURNING trader_id, daily_pnl, drawdown_pct, current_equity, peak_equity,
          trading_paused, paused_until, last_reset_time, updated_at
"#;

pub const INSERT_HISTORY: &str = r#"
INSERT INTO risk_state_history (
    trader_id, trace_id, reason, daily_pnl, drawdown_pct, current_equity,
    peak_equity, trading_paused, paused_until, last_reset_time, recorded_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
"#;

/// Atomic delta upsert (§4.4, §6). Adds the incoming delta to `daily_pnl`
/// and `current_equity`, lifts `peak_equity` with `GREATEST`, overwrites
/// set-marked fields only when their marker is true, and emits exactly one
/// history row from the post-update values via the `upserted` CTE.
///
/// Bind order: $1 trader_id, $2 delta_daily_pnl, $3 delta_equity,
/// $4 drawdown_set, $5 drawdown_value, $6 paused_set, $7 paused_value,
/// $8 paused_until_set, $9 paused_until_value, $10 last_reset_set,
/// $11 last_reset_value, $12 trace_id, $13 reason.
pub const UPSERT_DELTA: &str = r#"
WITH upserted AS (
    INSERT INTO risk_state (
        trader_id, daily_pnl, drawdown_pct, current_equity, peak_equity,
        trading_paused, paused_until, last_reset_time, updated_at
    )
    VALUES ($1, $2, $5, $3, $3, $7, $9, COALESCE($11, now()), now())
    ON CONFLICT (trader_id) DO UPDATE SET
        daily_pnl = risk_state.daily_pnl + EXCLUDED.daily_pnl,
        current_equity = risk_state.current_equity + EXCLUDED.current_equity,
        peak_equity = GREATEST(
            risk_state.peak_equity,
            risk_state.current_equity + EXCLUDED.current_equity
        ),
        drawdown_pct = CASE WHEN $4 THEN $5 ELSE risk_state.drawdown_pct END,
        trading_paused = CASE WHEN $6 THEN $7 ELSE risk_state.trading_paused END,
        paused_until = CASE WHEN $8 THEN $9 ELSE risk_state.paused_until END,
        last_reset_time = CASE WHEN $10 THEN $11 ELSE risk_state.last_reset_time END,
        updated_at = now()
    RETURNING trader_id, daily_pnl, drawdown_pct, current_equity, peak_equity,
              trading_paused, paused_until, last_reset_time
)
INSERT INTO risk_state_history (
    trader_id, trace_id, reason, daily_pnl, drawdown_pct, current_equity,
    peak_equity, trading_paused, paused_until, last_reset_time, recorded_at
)
SELECT trader_id, $12, $13, daily_pnl, drawdown_pct, current_equity,
       peak_equity, trading_paused, paused_until, last_reset_time, now()
FROM upserted
"#;

pub const SELECT_RISK_STATE: &str = r#"
SELECT trader_id, daily_pnl, drawdown_pct, current_equity, peak_equity,
       trading_paused, paused_until, last_reset_time, updated_at
FROM risk_state
WHERE trader_id = $1
"#;

pub const BACKFILL_LAST_RESET_TIME: &str = r#"
UPDATE risk_state SET last_reset_time = $2 WHERE trader_id = $1
"#;
