//! Backtesting engine
//!
//! Deterministic replay of historical ticks through a strategy, with
//! commission and slippage modeling, weighted average-cost position
//! accounting, and an append-only trade/portfolio ledger. Identical
//! inputs produce byte-identical ledgers and metrics; nothing in the
//! replay path reads the wall clock or randomness.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::condition::StrategyPayload;
use crate::market::MarketDataProvider;
use crate::store::SqliteStore;
use crate::types::{MarketId, MarketTick, OrderSide, PortfolioSnapshot, Position, Trade};

/// Expected trade refusal during simulation; replay logs it and continues
#[derive(Debug, Error, PartialEq)]
pub enum TradeRejection {
    #[error("quantity ({0}) must be positive")]
    NonPositiveQuantity(f64),

    #[error("insufficient cash: need {required:.2}, have {available:.2}")]
    InsufficientCash { required: f64, available: f64 },

    #[error("insufficient position: want {requested:.4}, hold {held:.4}")]
    InsufficientPosition { requested: f64, held: f64 },
}

/// Virtual portfolio replaying trades against historical ticks
pub struct BacktestSimulator {
    initial_capital: f64,
    commission_rate: f64,
    slippage_rate: f64,
    cash: f64,
    positions: HashMap<MarketId, Position>,
    trades: Vec<Trade>,
    snapshots: Vec<PortfolioSnapshot>,
}

impl BacktestSimulator {
    pub fn new(initial_capital: f64, commission_rate: f64, slippage_rate: f64) -> Self {
        Self {
            initial_capital,
            commission_rate,
            slippage_rate,
            cash: initial_capital,
            positions: HashMap::new(),
            trades: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, market: &MarketId) -> Option<&Position> {
        self.positions.get(market)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn snapshots(&self) -> &[PortfolioSnapshot] {
        &self.snapshots
    }

    /// Buy into a position. On insufficient cash the call is rejected
    /// with no state change.
    pub fn buy(
        &mut self,
        market: &MarketId,
        quantity: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TradeRejection> {
        if quantity <= 0.0 {
            return Err(TradeRejection::NonPositiveQuantity(quantity));
        }

        let cost = quantity * price;
        let commission = cost * self.commission_rate;
        let slippage = cost * self.slippage_rate;
        let total = cost + commission + slippage;

        if self.cash < total {
            return Err(TradeRejection::InsufficientCash {
                required: total,
                available: self.cash,
            });
        }

        self.positions
            .entry(market.clone())
            .or_insert_with(|| Position::new(market.clone()))
            .add(quantity, price);
        self.cash -= total;

        self.trades.push(Trade {
            market_id: market.clone(),
            resource_id: None,
            side: OrderSide::Buy,
            quantity,
            price,
            commission,
            slippage,
            profit: None,
            timestamp,
        });

        Ok(())
    }

    /// Sell out of a position. Realized profit is measured against the
    /// position's average cost, net of fees.
    pub fn sell(
        &mut self,
        market: &MarketId,
        quantity: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TradeRejection> {
        if quantity <= 0.0 {
            return Err(TradeRejection::NonPositiveQuantity(quantity));
        }

        let Some(position) = self.positions.get_mut(market) else {
            return Err(TradeRejection::InsufficientPosition {
                requested: quantity,
                held: 0.0,
            });
        };
        if quantity > position.quantity {
            return Err(TradeRejection::InsufficientPosition {
                requested: quantity,
                held: position.quantity,
            });
        }

        let income = quantity * price;
        let commission = income * self.commission_rate;
        let slippage = income * self.slippage_rate;
        let net_income = income - commission - slippage;
        let profit = quantity * (price - position.average_cost()) - commission - slippage;

        position.reduce(quantity);
        if position.is_flat() {
            self.positions.remove(market);
        }
        self.cash += net_income;

        self.trades.push(Trade {
            market_id: market.clone(),
            resource_id: None,
            side: OrderSide::Sell,
            quantity,
            price,
            commission,
            slippage,
            profit: Some(profit),
            timestamp,
        });

        Ok(())
    }

    /// Mark open positions to market and append an equity-curve point.
    /// Called after every replayed tick, trade or no trade, so the
    /// curve stays continuous.
    pub fn update_portfolio(&mut self, tick: &MarketTick) {
        let market_value: f64 = self
            .positions
            .values()
            .map(|p| {
                if p.market_id == tick.market_id {
                    p.market_value(tick.price)
                } else {
                    // Other markets keep their last known cost basis
                    p.total_cost
                }
            })
            .sum();

        let total_assets = self.cash + market_value;
        let cumulative_return = (total_assets - self.initial_capital) / self.initial_capital;

        self.snapshots.push(PortfolioSnapshot {
            timestamp: tick.timestamp,
            total_assets,
            cash: self.cash,
            market_value,
            cumulative_return,
        });
    }

    /// Replay a tick sequence through a parsed strategy payload.
    ///
    /// Ticks are processed in ascending time order; rejected trades are
    /// logged and never abort the run.
    pub fn replay(&mut self, payload: &StrategyPayload, ticks: &[MarketTick]) {
        let mut ordered: Vec<&MarketTick> = ticks.iter().collect();
        ordered.sort_by_key(|t| t.timestamp);

        for tick in ordered {
            if payload.conditions.matches(tick) {
                for action in &payload.actions {
                    let price = action.order_price(tick);
                    let outcome = if action.side.is_acquisition() {
                        self.buy(&tick.market_id, action.quantity, price, tick.timestamp)
                    } else {
                        self.sell(&tick.market_id, action.quantity, price, tick.timestamp)
                    };

                    if let Err(rejection) = outcome {
                        debug!(
                            "Trade rejected at {}: {} {} {:.4} @ {:.2}: {}",
                            tick.timestamp, action.side, tick.market_id, action.quantity, price,
                            rejection
                        );
                    }
                }
            }

            self.update_portfolio(tick);
        }
    }

    pub fn metrics(&self) -> BacktestMetrics {
        calculate_metrics(
            self.initial_capital,
            &self.trades,
            &self.snapshots,
        )
    }

    pub fn into_report(self) -> BacktestReport {
        let metrics = self.metrics();
        BacktestReport {
            initial_capital: self.initial_capital,
            final_cash: self.cash,
            trades: self.trades,
            snapshots: self.snapshots,
            metrics,
        }
    }
}

/// Performance metrics over one backtest run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_return: f64,
    pub win_rate: f64,
    pub average_profit: f64,
    pub average_loss: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub max_drawdown: f64,
    /// Mean per-tick return over its standard deviation, unannualized
    pub return_volatility_ratio: f64,
    pub total_trades: usize,
    pub total_sells: usize,
    pub profitable_sells: usize,
}

fn calculate_metrics(
    initial_capital: f64,
    trades: &[Trade],
    snapshots: &[PortfolioSnapshot],
) -> BacktestMetrics {
    let mut metrics = BacktestMetrics {
        total_trades: trades.len(),
        ..Default::default()
    };

    if let Some(last) = snapshots.last() {
        metrics.total_return = (last.total_assets - initial_capital) / initial_capital;
    }

    let sell_profits: Vec<f64> = trades.iter().filter_map(|t| t.profit).collect();
    metrics.total_sells = sell_profits.len();
    metrics.profitable_sells = sell_profits.iter().filter(|&&p| p > 0.0).count();
    if metrics.total_sells > 0 {
        metrics.win_rate = metrics.profitable_sells as f64 / metrics.total_sells as f64;
    }

    let wins: Vec<f64> = sell_profits.iter().copied().filter(|&p| p > 0.0).collect();
    let losses: Vec<f64> = sell_profits.iter().copied().filter(|&p| p < 0.0).collect();
    if !wins.is_empty() {
        metrics.average_profit = wins.iter().sum::<f64>() / wins.len() as f64;
    }
    if !losses.is_empty() {
        metrics.average_loss = losses.iter().sum::<f64>() / losses.len() as f64;
    }

    // Longest win/loss streaks over the ordered trade list
    let mut win_streak = 0usize;
    let mut loss_streak = 0usize;
    for &profit in &sell_profits {
        if profit > 0.0 {
            win_streak += 1;
            loss_streak = 0;
        } else {
            loss_streak += 1;
            win_streak = 0;
        }
        metrics.max_consecutive_wins = metrics.max_consecutive_wins.max(win_streak);
        metrics.max_consecutive_losses = metrics.max_consecutive_losses.max(loss_streak);
    }

    // Peak-to-trough drawdown over the equity curve
    let mut peak = initial_capital;
    for snapshot in snapshots {
        if snapshot.total_assets > peak {
            peak = snapshot.total_assets;
        }
        if peak > 0.0 {
            let dd = (peak - snapshot.total_assets) / peak;
            if dd > metrics.max_drawdown {
                metrics.max_drawdown = dd;
            }
        }
    }

    // Per-tick return mean over stddev; left unannualized because tick
    // spacing is market-dependent
    let returns: Vec<f64> = snapshots
        .windows(2)
        .filter(|w| w[0].total_assets > 0.0)
        .map(|w| (w[1].total_assets - w[0].total_assets) / w[0].total_assets)
        .collect();
    if returns.len() > 1 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev > 0.0 {
            metrics.return_volatility_ratio = mean / std_dev;
        }
    }

    metrics
}

/// Full result of one backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub initial_capital: f64,
    pub final_cash: f64,
    pub trades: Vec<Trade>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub metrics: BacktestMetrics,
}

/// Async entry point wiring the simulator to the strategy store and the
/// historical market-data provider.
pub struct BacktestRunner {
    store: Arc<SqliteStore>,
    market: Arc<dyn MarketDataProvider>,
}

impl BacktestRunner {
    pub fn new(store: Arc<SqliteStore>, market: Arc<dyn MarketDataProvider>) -> Self {
        Self { store, market }
    }

    pub async fn run_backtest(
        &self,
        strategy_id: i64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        initial_capital: f64,
        commission_rate: f64,
        slippage_rate: f64,
    ) -> Result<BacktestReport> {
        if initial_capital <= 0.0 {
            anyhow::bail!("initial capital must be positive, got {initial_capital}");
        }
        if window_end <= window_start {
            anyhow::bail!("backtest window end must be after start");
        }

        let strategy = self
            .store
            .get_strategy(strategy_id)?
            .with_context(|| format!("strategy {strategy_id} not found"))?;
        let payload = StrategyPayload::parse(&strategy.payload)
            .with_context(|| format!("strategy {strategy_id} payload is malformed"))?;

        let ticks = self
            .market
            .ticks_between(&strategy.market_id, window_start, window_end)
            .await
            .with_context(|| format!("loading ticks for {}", strategy.market_id))?;

        info!(
            "Backtesting strategy {} ({}) over {} ticks",
            strategy_id,
            strategy.name,
            ticks.len()
        );

        let mut simulator =
            BacktestSimulator::new(initial_capital, commission_rate, slippage_rate);
        simulator.replay(&payload, &ticks);

        Ok(simulator.into_report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn market() -> MarketId {
        MarketId::new("GRID-NORTH")
    }

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
    }

    fn simulator() -> BacktestSimulator {
        BacktestSimulator::new(10_000.0, 0.001, 0.0005)
    }

    #[test]
    fn test_buy_debits_cash_and_opens_position() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();

        // cost 1000, commission 1.0, slippage 0.5
        assert_relative_eq!(sim.cash(), 8_998.5);
        let pos = sim.position(&market()).unwrap();
        assert_eq!(pos.quantity, 10.0);
        assert_eq!(pos.average_cost(), 100.0);
    }

    #[test]
    fn test_buy_rejected_without_cash_leaves_state_unchanged() {
        let mut sim = simulator();
        let result = sim.buy(&market(), 1_000.0, 100.0, ts(0));
        assert!(matches!(result, Err(TradeRejection::InsufficientCash { .. })));
        assert_eq!(sim.cash(), 10_000.0);
        assert!(sim.position(&market()).is_none());
        assert!(sim.trades().is_empty());
    }

    #[test]
    fn test_sell_more_than_held_rejected() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();
        let result = sim.sell(&market(), 11.0, 110.0, ts(1));
        assert!(matches!(
            result,
            Err(TradeRejection::InsufficientPosition { .. })
        ));
        assert_eq!(sim.position(&market()).unwrap().quantity, 10.0);
    }

    #[test]
    fn test_round_trip_profit_and_cash() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();
        sim.sell(&market(), 10.0, 110.0, ts(1)).unwrap();

        // income 1100, fees 1.65, profit 10*(110-100) - 1.65
        let sell = sim.trades().last().unwrap();
        assert_relative_eq!(sell.profit.unwrap(), 98.35, epsilon = 1e-9);
        assert_relative_eq!(sim.cash(), 10_096.85, epsilon = 1e-9);
        assert!(sim.position(&market()).is_none());
    }

    #[test]
    fn test_partial_sell_keeps_average_cost() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();
        sim.buy(&market(), 10.0, 120.0, ts(1)).unwrap();
        sim.sell(&market(), 5.0, 130.0, ts(2)).unwrap();

        let pos = sim.position(&market()).unwrap();
        assert_eq!(pos.quantity, 15.0);
        assert_relative_eq!(pos.average_cost(), 110.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ledger_reconciles() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();
        sim.buy(&market(), 5.0, 90.0, ts(1)).unwrap();
        sim.sell(&market(), 8.0, 105.0, ts(2)).unwrap();

        let buys: f64 = sim
            .trades()
            .iter()
            .filter(|t| t.side == OrderSide::Buy)
            .map(|t| t.gross_amount() + t.commission + t.slippage)
            .sum();
        let sells: f64 = sim
            .trades()
            .iter()
            .filter(|t| t.side == OrderSide::Sell)
            .map(|t| t.gross_amount() - t.commission - t.slippage)
            .sum();

        // cash_final - cash_initial + buys - sells == 0
        assert_relative_eq!(sim.cash() - 10_000.0 + buys - sells, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_update_portfolio_appends_every_tick() {
        let mut sim = simulator();
        let tick = MarketTick::new_unchecked(market(), 100.0, 10.0, ts(0));
        sim.update_portfolio(&tick);
        sim.update_portfolio(&tick);
        assert_eq!(sim.snapshots().len(), 2);
        assert_eq!(sim.snapshots()[0].total_assets, 10_000.0);
    }

    #[test]
    fn test_mark_to_market() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();
        let tick = MarketTick::new_unchecked(market(), 110.0, 10.0, ts(1));
        sim.update_portfolio(&tick);

        let snapshot = sim.snapshots().last().unwrap();
        assert_relative_eq!(snapshot.market_value, 1_100.0);
        assert_relative_eq!(snapshot.total_assets, 8_998.5 + 1_100.0);
    }

    fn replay_payload() -> StrategyPayload {
        StrategyPayload::parse(&serde_json::json!({
            "conditions": [
                { "type": "threshold", "field": "price", "op": "lte", "value": 95.0 }
            ],
            "actions": [
                { "side": "Buy", "resource_id": "battery-7", "quantity": 2.0 }
            ]
        }))
        .unwrap()
    }

    fn replay_ticks() -> Vec<MarketTick> {
        [100.0, 94.0, 96.0, 93.0, 98.0]
            .iter()
            .enumerate()
            .map(|(i, &p)| MarketTick::new_unchecked(market(), p, 50.0, ts(i as i64 * 60)))
            .collect()
    }

    #[test]
    fn test_replay_trades_on_matches_only() {
        let mut sim = simulator();
        sim.replay(&replay_payload(), &replay_ticks());

        // Two ticks at or below 95
        assert_eq!(sim.trades().len(), 2);
        // One snapshot per tick regardless of trading
        assert_eq!(sim.snapshots().len(), 5);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut a = simulator();
        let mut b = simulator();
        a.replay(&replay_payload(), &replay_ticks());
        b.replay(&replay_payload(), &replay_ticks());

        assert_eq!(a.trades().len(), b.trades().len());
        for (x, y) in a.trades().iter().zip(b.trades()) {
            assert_eq!(x.quantity, y.quantity);
            assert_eq!(x.price, y.price);
            assert_eq!(x.commission, y.commission);
            assert_eq!(x.timestamp, y.timestamp);
        }
        assert_eq!(
            serde_json::to_string(&a.metrics()).unwrap(),
            serde_json::to_string(&b.metrics()).unwrap()
        );
    }

    #[test]
    fn test_metrics_win_rate_and_streaks() {
        let mut sim = simulator();
        // Two profitable round trips, one losing
        sim.buy(&market(), 1.0, 100.0, ts(0)).unwrap();
        sim.sell(&market(), 1.0, 120.0, ts(1)).unwrap();
        sim.buy(&market(), 1.0, 100.0, ts(2)).unwrap();
        sim.sell(&market(), 1.0, 115.0, ts(3)).unwrap();
        sim.buy(&market(), 1.0, 100.0, ts(4)).unwrap();
        sim.sell(&market(), 1.0, 80.0, ts(5)).unwrap();

        let metrics = sim.metrics();
        assert_eq!(metrics.total_sells, 3);
        assert_eq!(metrics.profitable_sells, 2);
        assert_relative_eq!(metrics.win_rate, 2.0 / 3.0);
        assert_eq!(metrics.max_consecutive_wins, 2);
        assert_eq!(metrics.max_consecutive_losses, 1);
        assert!(metrics.average_profit > 0.0);
        assert!(metrics.average_loss < 0.0);
    }

    #[tokio::test]
    async fn test_runner_replays_stored_strategy() {
        use crate::market::InMemoryMarketData;
        use crate::types::StrategyStatus;

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .insert_strategy(
                "cheap charge",
                StrategyStatus::Active,
                &market(),
                &serde_json::json!({
                    "conditions": [
                        { "type": "threshold", "field": "price", "op": "lte", "value": 95.0 }
                    ],
                    "actions": [
                        { "side": "Buy", "resource_id": "battery-7", "quantity": 2.0 }
                    ]
                }),
            )
            .unwrap();

        let data = Arc::new(InMemoryMarketData::new());
        data.extend(replay_ticks());

        let runner = BacktestRunner::new(store, data);
        let report = runner
            .run_backtest(id, ts(0), ts(3600), 10_000.0, 0.001, 0.0005)
            .await
            .unwrap();

        assert_eq!(report.trades.len(), 2);
        assert_eq!(report.snapshots.len(), 5);
    }

    #[tokio::test]
    async fn test_runner_rejects_bad_parameters() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let data = Arc::new(crate::market::InMemoryMarketData::new());
        let runner = BacktestRunner::new(store, data);

        assert!(runner
            .run_backtest(1, ts(0), ts(3600), 0.0, 0.001, 0.0005)
            .await
            .is_err());
        assert!(runner
            .run_backtest(1, ts(3600), ts(0), 10_000.0, 0.001, 0.0005)
            .await
            .is_err());
        // Unknown strategy id
        assert!(runner
            .run_backtest(1, ts(0), ts(3600), 10_000.0, 0.001, 0.0005)
            .await
            .is_err());
    }

    #[test]
    fn test_max_drawdown() {
        let mut sim = simulator();
        sim.buy(&market(), 10.0, 100.0, ts(0)).unwrap();
        for (i, price) in [120.0, 90.0, 110.0].iter().enumerate() {
            let tick = MarketTick::new_unchecked(market(), *price, 10.0, ts(i as i64 + 1));
            sim.update_portfolio(&tick);
        }

        // Peak at 120-mark, trough at 90-mark
        let peak = 8_998.5 + 1_200.0;
        let trough = 8_998.5 + 900.0;
        let expected = (peak - trough) / peak;
        assert_relative_eq!(sim.metrics().max_drawdown, expected, epsilon = 1e-9);
    }
}
