//! Order execution gateway
//!
//! Abstraction over order placement. Live deployments put the external
//! market connector behind this trait; simulated mode uses
//! `PaperGateway`, which fills at the order price and appends to a
//! shared ledger with the same commission semantics the backtest
//! simulator uses.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

use crate::types::{ExecutionResult, Trade, TradingOrder};

/// Transient connector failure. Callers catch this per order, log it,
/// and continue with the rest of the batch; rejections travel as
/// `ExecutionResult { success: false, .. }` instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connector timeout: {0}")]
    Timeout(String),

    #[error("connector unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit(&self, order: &TradingOrder) -> Result<ExecutionResult, GatewayError>;
}

/// Simulated gateway: immediate fill at the order price.
///
/// The ledger handle is shared so the scheduler, arbitrage engine, and
/// settlement tests all observe one trade stream.
pub struct PaperGateway {
    commission_rate: f64,
    ledger: Arc<Mutex<Vec<Trade>>>,
}

impl PaperGateway {
    pub fn new(commission_rate: f64) -> Self {
        Self {
            commission_rate,
            ledger: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_ledger(commission_rate: f64, ledger: Arc<Mutex<Vec<Trade>>>) -> Self {
        Self {
            commission_rate,
            ledger,
        }
    }

    pub fn ledger(&self) -> Arc<Mutex<Vec<Trade>>> {
        Arc::clone(&self.ledger)
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.ledger.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn submit(&self, order: &TradingOrder) -> Result<ExecutionResult, GatewayError> {
        let amount = order.notional();
        let commission = amount * self.commission_rate;

        let trade = Trade {
            market_id: order.market_id.clone(),
            resource_id: Some(order.resource_id.clone()),
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            commission,
            slippage: 0.0,
            profit: None,
            timestamp: Utc::now(),
        };
        self.ledger.lock().unwrap().push(trade);

        debug!(
            "Paper fill: {} {} {:.4} @ {:.2} (commission {:.4})",
            order.side, order.market_id, order.quantity, order.price, commission
        );

        Ok(ExecutionResult::filled(order.price, amount, commission))
    }
}
