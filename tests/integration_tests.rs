//! Cross-module integration tests

use approx::assert_relative_eq;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use vpp_trading::arbitrage::{ArbitrageEngine, ArbitrageSummary};
use vpp_trading::backtest::BacktestSimulator;
use vpp_trading::condition::StrategyPayload;
use vpp_trading::gateway::PaperGateway;
use vpp_trading::market::{InMemoryMarketData, MarketDataProvider};
use vpp_trading::risk::RiskGateConfig;
use vpp_trading::settlement::{FactorBasedCarbon, SettlementEngine};
use vpp_trading::store::SqliteStore;
use vpp_trading::{
    ArbitrageKind, DistributionPolicy, MarketId, MarketTick, OrderSide, ResourceCapacityInfo,
    SettlementPeriod, Trade,
};

fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
}

fn market() -> MarketId {
    MarketId::new("GRID-NORTH")
}

fn resource(id: &str, capacity: f64) -> ResourceCapacityInfo {
    ResourceCapacityInfo {
        resource_id: id.to_string(),
        capacity_kw: capacity,
        available_kw: capacity,
        max_power_kw: capacity,
        min_power_kw: 0.0,
    }
}

fn ledger_trade(resource_id: &str, side: OrderSide, quantity: f64, price: f64, hour: u32) -> Trade {
    Trade {
        market_id: market(),
        resource_id: Some(resource_id.to_string()),
        side,
        quantity,
        price,
        commission: quantity * price * 0.001,
        slippage: 0.0,
        profit: None,
        timestamp: ts(hour),
    }
}

fn settlement_engine(store: Arc<SqliteStore>) -> SettlementEngine {
    SettlementEngine::new(store, Arc::new(FactorBasedCarbon { factor_kg: 0.4 }))
}

// =============================================================================
// Backtest scenarios
// =============================================================================

#[test]
fn test_backtest_round_trip_scenario() {
    let m = market();
    let mut sim = BacktestSimulator::new(10_000.0, 0.001, 0.0005);

    sim.buy(&m, 10.0, 100.0, ts(0)).unwrap();
    // cost 1000, commission 1.0, slippage 0.5
    assert_relative_eq!(sim.cash(), 8_998.5);
    let pos = sim.position(&m).unwrap();
    assert_eq!(pos.quantity, 10.0);
    assert_relative_eq!(pos.average_cost(), 100.0);

    sim.sell(&m, 10.0, 110.0, ts(1)).unwrap();
    // income 1100, fees 1.65, profit 98.35
    assert_relative_eq!(sim.cash(), 10_096.85, epsilon = 1e-9);
    assert!(sim.position(&m).is_none());
    let profit = sim.trades().last().unwrap().profit.unwrap();
    assert_relative_eq!(profit, 98.35, epsilon = 1e-9);
}

#[test]
fn test_backtest_closed_ledger_reconciles() {
    let m = market();
    let mut sim = BacktestSimulator::new(50_000.0, 0.002, 0.001);

    sim.buy(&m, 20.0, 95.0, ts(0)).unwrap();
    sim.buy(&m, 10.0, 105.0, ts(1)).unwrap();
    sim.sell(&m, 15.0, 112.0, ts(2)).unwrap();
    sim.buy(&m, 5.0, 99.0, ts(3)).unwrap();
    sim.sell(&m, 20.0, 90.0, ts(4)).unwrap();

    let outflow: f64 = sim
        .trades()
        .iter()
        .filter(|t| t.side.is_acquisition())
        .map(|t| t.gross_amount() + t.commission + t.slippage)
        .sum();
    let inflow: f64 = sim
        .trades()
        .iter()
        .filter(|t| t.side.is_disposal())
        .map(|t| t.gross_amount() - t.commission - t.slippage)
        .sum();
    assert_relative_eq!(sim.cash(), 50_000.0 - outflow + inflow, epsilon = 1e-9);
}

#[test]
fn test_backtest_replay_is_deterministic() {
    let payload = StrategyPayload::parse(&serde_json::json!({
        "conditions": [
            { "type": "range", "field": "price", "min": 40.0, "max": 60.0 },
            { "type": "threshold", "field": "volume", "op": "gt", "value": 5.0 }
        ],
        "actions": [
            { "side": "Buy", "resource_id": "battery-7", "quantity": 3.0 },
            { "side": "Sell", "resource_id": "battery-7", "quantity": 1.0 }
        ]
    }))
    .unwrap();

    let ticks: Vec<MarketTick> = [52.0, 61.0, 45.0, 58.0, 39.0, 50.0]
        .iter()
        .enumerate()
        .map(|(i, &p)| MarketTick::new_unchecked(market(), p, 10.0, ts(i as u32)))
        .collect();

    let run = |_: usize| {
        let mut sim = BacktestSimulator::new(10_000.0, 0.001, 0.0005);
        sim.replay(&payload, &ticks);
        let report = sim.into_report();
        serde_json::to_string(&report).unwrap()
    };

    assert_eq!(run(0), run(1));
}

// =============================================================================
// Settlement scenarios
// =============================================================================

#[test]
fn test_settlement_distribution_invariants() {
    for policy in [
        DistributionPolicy::CapacityWeighted,
        DistributionPolicy::ContributionWeighted,
        DistributionPolicy::EqualShare,
    ] {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.upsert_resource("vpp-1", &resource("battery-7", 500.0)).unwrap();
        store.upsert_resource("vpp-1", &resource("solar-3", 230.0)).unwrap();
        store.upsert_resource("vpp-1", &resource("wind-1", 120.0)).unwrap();

        store
            .record_trade(&ledger_trade("battery-7", OrderSide::Buy, 30.0, 41.0, 1))
            .unwrap();
        store
            .record_trade(&ledger_trade("battery-7", OrderSide::Discharge, 30.0, 57.0, 9))
            .unwrap();
        store
            .record_trade(&ledger_trade("solar-3", OrderSide::Sell, 12.0, 55.0, 13))
            .unwrap();

        let engine = settlement_engine(Arc::clone(&store));
        let period = SettlementPeriod::day(chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        let record = engine
            .execute_settlement("vpp-1", &period, policy)
            .unwrap();

        assert!(record.net_profit > 0.0);
        assert_eq!(record.distributions.len(), 3);

        let ratio_sum: f64 = record.distributions.iter().map(|d| d.ratio).sum();
        assert_relative_eq!(ratio_sum, 1.0, epsilon = 1e-6);

        let amount_sum: f64 = record.distributions.iter().map(|d| d.amount).sum();
        assert!(
            (amount_sum - record.net_profit).abs() <= 1.0,
            "policy {:?}: amounts {:.4} vs net {:.4}",
            policy,
            amount_sum,
            record.net_profit
        );
    }
}

#[test]
fn test_settlement_double_call_does_not_double_credit() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.upsert_resource("vpp-1", &resource("battery-7", 500.0)).unwrap();
    store
        .record_trade(&ledger_trade("battery-7", OrderSide::Discharge, 20.0, 50.0, 8))
        .unwrap();

    let engine = settlement_engine(Arc::clone(&store));
    let period = SettlementPeriod::day(chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());

    let first = engine
        .execute_settlement("vpp-1", &period, DistributionPolicy::CapacityWeighted)
        .unwrap();
    let second = engine
        .execute_settlement("vpp-1", &period, DistributionPolicy::CapacityWeighted)
        .unwrap();

    assert_eq!(first.settled_at, second.settled_at);
    let credited = store.cumulative_profit("battery-7").unwrap().unwrap();
    assert_relative_eq!(credited, first.net_profit, epsilon = 1e-9);

    assert_eq!(engine.get_settlement_history("vpp-1").unwrap().len(), 1);
}

#[test]
fn test_settlement_report_and_ranking_flow() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.upsert_resource("vpp-1", &resource("battery-7", 400.0)).unwrap();
    store.upsert_resource("vpp-1", &resource("solar-3", 400.0)).unwrap();

    // battery-7 trades profitably, solar-3 does not trade
    store
        .record_trade(&ledger_trade("battery-7", OrderSide::Buy, 10.0, 40.0, 2))
        .unwrap();
    store
        .record_trade(&ledger_trade("battery-7", OrderSide::Discharge, 10.0, 60.0, 18))
        .unwrap();

    let engine = settlement_engine(Arc::clone(&store));
    let period = SettlementPeriod::day(chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());

    engine
        .execute_settlement("vpp-1", &period, DistributionPolicy::ContributionWeighted)
        .unwrap();

    // All the traded value came from battery-7
    let ranking = engine.get_resource_profit_ranking("vpp-1", 10).unwrap();
    assert_eq!(ranking[0].0, "battery-7");
    assert!(ranking[0].1 > 0.0);
    assert_eq!(ranking[1].1, 0.0);

    let report = engine.generate_performance_report("vpp-1", &period).unwrap();
    assert_eq!(report.trade_count, 2);
    assert_relative_eq!(report.delivered_volume, 10.0);
    assert_relative_eq!(report.carbon_reduction_kg, 4.0);
    assert!(report.net_profit > 0.0);
    assert!(report.capacity_factor > 0.0);
}

// =============================================================================
// Arbitrage scenarios
// =============================================================================

fn arbitrage_fixture() -> (ArbitrageEngine, Arc<InMemoryMarketData>, Arc<PaperGateway>) {
    let data = Arc::new(InMemoryMarketData::new());
    let gateway = Arc::new(PaperGateway::new(0.001));
    let engine = ArbitrageEngine::new(
        Arc::clone(&data) as Arc<dyn MarketDataProvider>,
        RiskGateConfig::default().build(),
        Arc::clone(&gateway) as _,
    );
    (engine, data, gateway)
}

#[tokio::test]
async fn test_arbitrage_margin_boundary() {
    let markets = vec![MarketId::new("GRID-NORTH"), MarketId::new("GRID-SOUTH")];

    // 100 vs 110: margin = 10 / 105 ~ 0.0952
    let (engine, data, gateway) = arbitrage_fixture();
    data.push(MarketTick::new_unchecked(markets[0].clone(), 100.0, 80.0, ts(0)));
    data.push(MarketTick::new_unchecked(markets[1].clone(), 110.0, 50.0, ts(0)));

    let summary = engine
        .execute_arbitrage_strategy(&markets, ArbitrageKind::Spatial, 0.05, 1.0)
        .await
        .unwrap();
    assert_eq!(summary.opportunities_found, 1);
    assert_eq!(summary.opportunities_executed, 1);
    // Buy leg on the cheaper market, volume capped by the thinner side
    let trades = gateway.trades();
    assert_eq!(trades[0].market_id, markets[0]);
    assert_eq!(trades[0].side, OrderSide::Buy);
    assert_relative_eq!(trades[0].quantity, 50.0);

    // Same gap against a 0.10 threshold finds nothing
    let (engine, data, gateway) = arbitrage_fixture();
    data.push(MarketTick::new_unchecked(markets[0].clone(), 100.0, 80.0, ts(0)));
    data.push(MarketTick::new_unchecked(markets[1].clone(), 110.0, 50.0, ts(0)));

    let summary = engine
        .execute_arbitrage_strategy(&markets, ArbitrageKind::Spatial, 0.10, 1.0)
        .await
        .unwrap();
    assert_eq!(summary, ArbitrageSummary::default());
    assert!(gateway.trades().is_empty());
}

#[tokio::test]
async fn test_arbitrage_rescan_does_not_repeat_execution() {
    let markets = vec![MarketId::new("GRID-NORTH"), MarketId::new("GRID-SOUTH")];
    let (engine, data, gateway) = arbitrage_fixture();
    data.push(MarketTick::new_unchecked(markets[0].clone(), 100.0, 80.0, ts(0)));
    data.push(MarketTick::new_unchecked(markets[1].clone(), 120.0, 80.0, ts(0)));

    let first = engine
        .execute_arbitrage_strategy(&markets, ArbitrageKind::Spatial, 0.05, 1.0)
        .await
        .unwrap();
    let second = engine
        .execute_arbitrage_strategy(&markets, ArbitrageKind::Spatial, 0.05, 1.0)
        .await
        .unwrap();

    assert_eq!(first.opportunities_executed, 1);
    assert_relative_eq!(first.total_profit, 20.0 * 80.0);
    assert_eq!(second.opportunities_executed, 0);
    assert_eq!(gateway.trades().len(), 2);
}
