//! Exchange connector capability (§4.5.1): the narrow surface the
//! supervisor depends on for order-outcome feedback and the guarded
//! stop-loss policy. No concrete venue adapter lives here — venues are an
//! out-of-scope external collaborator; this crate ships the trait and an
//! in-memory test double only.

use async_trait::async_trait;

use crate::error::RiskResult;

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
}

#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn get_balance(&self) -> RiskResult<f64>;
    async fn get_positions(&self) -> RiskResult<Vec<Position>>;
    async fn open_long(&self, symbol: &str, quantity: f64) -> RiskResult<()>;
    async fn open_short(&self, symbol: &str, quantity: f64) -> RiskResult<()>;
    async fn close_long(&self, symbol: &str, quantity: f64) -> RiskResult<()>;
    async fn close_short(&self, symbol: &str, quantity: f64) -> RiskResult<()>;
    async fn set_stop_loss(&self, symbol: &str, price: f64) -> RiskResult<()>;
    async fn set_take_profit(&self, symbol: &str, price: f64) -> RiskResult<()>;
    async fn cancel_all_orders(&self, symbol: &str) -> RiskResult<()>;
    fn format_quantity(&self, raw: f64) -> String;
}

/// In-memory test double. Records every call so supervisor tests can
/// assert on the guarded-stop-loss cancellation path without a live venue.
#[derive(Debug, Default)]
pub struct NullExchange {
    pub calls: tokio::sync::Mutex<Vec<String>>,
    pub fail_stop_loss: std::sync::atomic::AtomicBool,
}

impl NullExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_stop_loss() -> Self {
        let exchange = Self::default();
        exchange
            .fail_stop_loss
            .store(true, std::sync::atomic::Ordering::Relaxed);
        exchange
    }

    async fn record(&self, call: impl Into<String>) {
        self.calls.lock().await.push(call.into());
    }
}

#[async_trait]
impl ExchangeConnector for NullExchange {
    async fn get_balance(&self) -> RiskResult<f64> {
        Ok(0.0)
    }

    async fn get_positions(&self) -> RiskResult<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn open_long(&self, symbol: &str, quantity: f64) -> RiskResult<()> {
        self.record(format!("open_long:{symbol}:{quantity}")).await;
        Ok(())
    }

    async fn open_short(&self, symbol: &str, quantity: f64) -> RiskResult<()> {
        self.record(format!("open_short:{symbol}:{quantity}")).await;
        Ok(())
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> RiskResult<()> {
        self.record(format!("close_long:{symbol}:{quantity}")).await;
        Ok(())
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> RiskResult<()> {
        self.record(format!("close_short:{symbol}:{quantity}")).await;
        Ok(())
    }

    async fn set_stop_loss(&self, symbol: &str, price: f64) -> RiskResult<()> {
        self.record(format!("set_stop_loss:{symbol}:{price}")).await;
        if self.fail_stop_loss.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(crate::error::RiskError::Validation(
                "stop-loss placement failed".into(),
            ));
        }
        Ok(())
    }

    async fn set_take_profit(&self, symbol: &str, price: f64) -> RiskResult<()> {
        self.record(format!("set_take_profit:{symbol}:{price}")).await;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> RiskResult<()> {
        self.record(format!("cancel_all_orders:{symbol}")).await;
        Ok(())
    }

    fn format_quantity(&self, raw: f64) -> String {
        format!("{raw:.6}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_exchange_records_calls() {
        let exchange = NullExchange::new();
        exchange.open_long("BTC-USD", 1.5).await.unwrap();
        let calls = exchange.calls.lock().await;
        assert_eq!(calls.as_slice(), ["open_long:BTC-USD:1.5"]);
    }

    #[tokio::test]
    async fn failing_stop_loss_double_returns_error() {
        let exchange = NullExchange::failing_stop_loss();
        assert!(exchange.set_stop_loss("BTC-USD", 100.0).await.is_err());
    }
}
