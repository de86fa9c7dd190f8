//! Arbitrage engine
//!
//! Scans market snapshots for spatial (cross-market) and temporal
//! (single-market) price gaps, gates each opportunity on a margin-derived
//! risk score, and executes paired legs through the risk gate and
//! gateway. Opportunity ids are cached so a detected gap executes at
//! most once.

use anyhow::Result;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::gateway::ExecutionGateway;
use crate::market::MarketDataProvider;
use crate::risk::{RiskContext, RiskGate};
use crate::types::{
    ArbitrageKind, ArbitrageOpportunity, MarketId, MarketTick, OrderSide, OrderStatus,
    TradingOrder,
};

/// Temporal detection looks back this many samples per market
const TEMPORAL_WINDOW: usize = 24;

/// Margin at or above this scores as riskless
const RISKLESS_MARGIN: f64 = 0.5;

/// Outcome of one arbitrage scan cycle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArbitrageSummary {
    pub opportunities_found: usize,
    pub opportunities_executed: usize,
    pub total_profit: f64,
}

pub struct ArbitrageEngine {
    market: Arc<dyn MarketDataProvider>,
    risk: RiskGate,
    gateway: Arc<dyn ExecutionGateway>,
    seen: Mutex<HashSet<String>>,
}

impl ArbitrageEngine {
    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        risk: RiskGate,
        gateway: Arc<dyn ExecutionGateway>,
    ) -> Self {
        Self {
            market,
            risk,
            gateway,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// One scan-and-execute cycle over the given markets.
    ///
    /// `min_margin` is inclusive: a gap exactly at the threshold counts.
    /// Opportunities execute only while their risk score stays within
    /// `max_risk`; each id executes at most once across cycles.
    pub async fn execute_arbitrage_strategy(
        &self,
        markets: &[MarketId],
        kind: ArbitrageKind,
        min_margin: f64,
        max_risk: f64,
    ) -> Result<ArbitrageSummary> {
        let opportunities = self.detect(markets, kind, min_margin).await?;

        let mut summary = ArbitrageSummary {
            opportunities_found: opportunities.len(),
            ..Default::default()
        };

        for opportunity in opportunities {
            {
                let mut seen = self.seen.lock().unwrap();
                if !seen.insert(opportunity.id.clone()) {
                    debug!("Opportunity {} already handled, skipping", opportunity.id);
                    continue;
                }
            }

            let score = risk_score(opportunity.profit_margin);
            if score > max_risk {
                debug!(
                    "Opportunity {} risk {:.3} above tolerance {:.3}, skipping",
                    opportunity.id, score, max_risk
                );
                continue;
            }

            match self.execute_pair(&opportunity).await {
                Ok(true) => {
                    summary.opportunities_executed += 1;
                    summary.total_profit += opportunity.expected_profit();
                }
                Ok(false) => {}
                Err(e) => warn!("Opportunity {} execution failed: {:#}", opportunity.id, e),
            }
        }

        info!(
            "{} scan: {} found, {} executed, profit {:.2}",
            kind, summary.opportunities_found, summary.opportunities_executed, summary.total_profit
        );
        Ok(summary)
    }

    async fn detect(
        &self,
        markets: &[MarketId],
        kind: ArbitrageKind,
        min_margin: f64,
    ) -> Result<Vec<ArbitrageOpportunity>> {
        match kind {
            ArbitrageKind::Spatial => self.detect_spatial(markets, min_margin).await,
            ArbitrageKind::Temporal => self.detect_temporal(markets, min_margin).await,
            ArbitrageKind::CrossCommodity => {
                info!("Cross-commodity detection is not wired to a commodity feed yet");
                Ok(Vec::new())
            }
        }
    }

    /// Price gaps between markets at the same instant
    async fn detect_spatial(
        &self,
        markets: &[MarketId],
        min_margin: f64,
    ) -> Result<Vec<ArbitrageOpportunity>> {
        let mut latest: Vec<MarketTick> = Vec::with_capacity(markets.len());
        for market in markets {
            match self.market.latest_ticks(market, 1).await {
                Ok(ticks) => latest.extend(ticks),
                Err(e) => warn!("Skipping {} in spatial scan: {}", market, e),
            }
        }

        let mut opportunities = Vec::new();
        for (a, b) in latest.iter().tuple_combinations() {
            let avg = (a.price + b.price) / 2.0;
            if avg <= 0.0 {
                continue;
            }
            let margin = (a.price - b.price).abs() / avg;
            if margin < min_margin {
                continue;
            }

            let (buy, sell) = if a.price <= b.price { (a, b) } else { (b, a) };
            let detected_at = buy.timestamp.max(sell.timestamp);
            opportunities.push(ArbitrageOpportunity {
                id: ArbitrageOpportunity::derive_id(
                    ArbitrageKind::Spatial,
                    &buy.market_id,
                    &sell.market_id,
                    detected_at,
                ),
                kind: ArbitrageKind::Spatial,
                buy_market: buy.market_id.clone(),
                sell_market: sell.market_id.clone(),
                buy_price: buy.price,
                sell_price: sell.price,
                volume: buy.volume.min(sell.volume),
                profit_margin: margin,
                buy_time: buy.timestamp,
                sell_time: sell.timestamp,
            });
        }
        Ok(opportunities)
    }

    /// Price swings within one market's recent history
    async fn detect_temporal(
        &self,
        markets: &[MarketId],
        min_margin: f64,
    ) -> Result<Vec<ArbitrageOpportunity>> {
        let mut opportunities = Vec::new();

        for market in markets {
            let ticks = match self.market.latest_ticks(market, TEMPORAL_WINDOW).await {
                Ok(ticks) => ticks,
                Err(e) => {
                    warn!("Skipping {} in temporal scan: {}", market, e);
                    continue;
                }
            };
            if ticks.len() < 2 {
                continue;
            }

            let low = ticks
                .iter()
                .min_by(|x, y| x.price.total_cmp(&y.price))
                .unwrap();
            let high = ticks
                .iter()
                .max_by(|x, y| x.price.total_cmp(&y.price))
                .unwrap();
            if low.price <= 0.0 {
                continue;
            }

            let margin = (high.price - low.price) / low.price;
            if margin < min_margin {
                continue;
            }

            let detected_at = ticks.last().unwrap().timestamp;
            opportunities.push(ArbitrageOpportunity {
                id: ArbitrageOpportunity::derive_id(
                    ArbitrageKind::Temporal,
                    market,
                    market,
                    detected_at,
                ),
                kind: ArbitrageKind::Temporal,
                buy_market: market.clone(),
                sell_market: market.clone(),
                buy_price: low.price,
                sell_price: high.price,
                volume: low.volume.min(high.volume),
                profit_margin: margin,
                buy_time: low.timestamp,
                sell_time: high.timestamp,
            });
        }
        Ok(opportunities)
    }

    /// Submit both legs; profit counts only when both fill
    async fn execute_pair(&self, opportunity: &ArbitrageOpportunity) -> Result<bool> {
        let buy = leg_order(opportunity, OrderSide::Buy);
        let sell = leg_order(opportunity, OrderSide::Sell);

        if !self.submit_leg(&buy, opportunity.buy_price).await? {
            return Ok(false);
        }
        if !self.submit_leg(&sell, opportunity.sell_price).await? {
            // Buy leg is already in the books; the position unwinds on
            // the next scan cycle
            warn!(
                "Opportunity {} sell leg failed after buy leg filled",
                opportunity.id
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn submit_leg(&self, order: &TradingOrder, reference_price: f64) -> Result<bool> {
        let ctx = RiskContext {
            reference_price,
            ..Default::default()
        };
        if let Err(violation) = self.risk.validate(order, &ctx) {
            debug!("Leg {} blocked: {}", order.id, violation);
            return Ok(false);
        }
        match self.gateway.submit(order).await {
            Ok(result) => Ok(result.success),
            Err(e) => {
                warn!("Leg {} connector failure: {}", order.id, e);
                Ok(false)
            }
        }
    }
}

fn leg_order(opportunity: &ArbitrageOpportunity, side: OrderSide) -> TradingOrder {
    let (market, price, at) = match side {
        OrderSide::Buy | OrderSide::Charge => (
            &opportunity.buy_market,
            opportunity.buy_price,
            opportunity.buy_time,
        ),
        OrderSide::Sell | OrderSide::Discharge => (
            &opportunity.sell_market,
            opportunity.sell_price,
            opportunity.sell_time,
        ),
    };
    TradingOrder {
        id: format!("{}:{}:{}", opportunity.id, side, at.timestamp_millis()),
        strategy_id: None,
        resource_id: "arbitrage".to_string(),
        market_id: market.clone(),
        side,
        quantity: opportunity.volume,
        price,
        status: OrderStatus::Pending,
    }
}

/// Higher margin means lower risk; margins at `RISKLESS_MARGIN` or above
/// score zero.
fn risk_score(margin: f64) -> f64 {
    1.0 - (margin / RISKLESS_MARGIN).clamp(0.0, 1.0)
}
