//! Pre-trade risk gate
//!
//! Stateless validation shared by the live scheduler/arbitrage path and
//! simulated execution. Per-order state (capital, position, recent order
//! count) arrives in a `RiskContext`; the gate itself holds only limits.
//!
//! A violation is an expected outcome: callers convert it into a failed
//! `ExecutionResult` and keep processing the rest of the batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TradingOrder;

/// Risk gate limits, builder-style
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGateConfig {
    /// Largest single-order notional (quantity x price)
    pub max_order_notional: f64,
    /// Largest post-trade position quantity per market
    pub max_position_quantity: f64,
    /// Orders allowed per strategy per minute
    pub max_orders_per_minute: u32,
    /// Allowed relative deviation from the reference price
    pub max_price_deviation: f64,
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            max_order_notional: 50_000.0,
            max_position_quantity: 1_000.0,
            max_orders_per_minute: 30,
            max_price_deviation: 0.20,
        }
    }
}

impl RiskGateConfig {
    pub fn with_max_order_notional(mut self, notional: f64) -> Self {
        self.max_order_notional = notional;
        self
    }

    pub fn with_max_position_quantity(mut self, quantity: f64) -> Self {
        self.max_position_quantity = quantity;
        self
    }

    pub fn with_max_orders_per_minute(mut self, count: u32) -> Self {
        self.max_orders_per_minute = count;
        self
    }

    pub fn with_max_price_deviation(mut self, deviation: f64) -> Self {
        self.max_price_deviation = deviation;
        self
    }

    pub fn build(self) -> RiskGate {
        RiskGate { config: self }
    }
}

/// Why an order was refused before reaching the gateway
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskViolation {
    #[error("order quantity ({0}) must be positive")]
    NonPositiveQuantity(f64),

    #[error("order price ({0}) must be positive")]
    NonPositivePrice(f64),

    #[error("insufficient capital: need {required:.2}, have {available:.2}")]
    InsufficientCapital { required: f64, available: f64 },

    #[error("order notional {notional:.2} exceeds limit {limit:.2}")]
    NotionalLimit { notional: f64, limit: f64 },

    #[error("position would reach {resulting:.2}, limit {limit:.2}")]
    PositionLimit { resulting: f64, limit: f64 },

    #[error("{count} orders this minute, limit {limit}")]
    ExcessiveFrequency { count: u32, limit: u32 },

    #[error("price {price:.2} deviates {deviation:.1}% from reference {reference:.2}")]
    PriceOutOfBand {
        price: f64,
        reference: f64,
        deviation: f64,
    },
}

/// Caller-supplied state for one validation
#[derive(Debug, Clone, Copy)]
pub struct RiskContext {
    pub available_capital: f64,
    /// Current position quantity in the order's market
    pub position_quantity: f64,
    pub orders_this_minute: u32,
    /// Latest observed market price; zero disables the sanity band
    pub reference_price: f64,
}

impl Default for RiskContext {
    fn default() -> Self {
        Self {
            available_capital: f64::MAX,
            position_quantity: 0.0,
            orders_this_minute: 0,
            reference_price: 0.0,
        }
    }
}

/// Stateless pre-trade validator
#[derive(Debug, Clone)]
pub struct RiskGate {
    config: RiskGateConfig,
}

impl RiskGate {
    pub fn new(config: RiskGateConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, order: &TradingOrder, ctx: &RiskContext) -> Result<(), RiskViolation> {
        if order.quantity <= 0.0 {
            return Err(RiskViolation::NonPositiveQuantity(order.quantity));
        }
        if order.price <= 0.0 {
            return Err(RiskViolation::NonPositivePrice(order.price));
        }

        let notional = order.notional();
        if notional > self.config.max_order_notional {
            return Err(RiskViolation::NotionalLimit {
                notional,
                limit: self.config.max_order_notional,
            });
        }

        if order.side.is_acquisition() {
            if notional > ctx.available_capital {
                return Err(RiskViolation::InsufficientCapital {
                    required: notional,
                    available: ctx.available_capital,
                });
            }

            let resulting = ctx.position_quantity + order.quantity;
            if resulting > self.config.max_position_quantity {
                return Err(RiskViolation::PositionLimit {
                    resulting,
                    limit: self.config.max_position_quantity,
                });
            }
        }

        if ctx.orders_this_minute >= self.config.max_orders_per_minute {
            return Err(RiskViolation::ExcessiveFrequency {
                count: ctx.orders_this_minute,
                limit: self.config.max_orders_per_minute,
            });
        }

        if ctx.reference_price > 0.0 {
            let deviation = (order.price - ctx.reference_price).abs() / ctx.reference_price;
            if deviation > self.config.max_price_deviation {
                return Err(RiskViolation::PriceOutOfBand {
                    price: order.price,
                    reference: ctx.reference_price,
                    deviation: deviation * 100.0,
                });
            }
        }

        Ok(())
    }
}
