//! Settlement engine
//!
//! Settles one (vpp, period) pair at most once: totals from the trade
//! ledger, profit split across resources by the chosen policy, and one
//! SQLite transaction for the record, its distributions, and the
//! resource profit credits. Calling it again for the same pair returns
//! the stored record untouched.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::SqliteStore;
use crate::types::{
    DistributionPolicy, ProfitDistribution, ResourceCapacityInfo, SettlementPeriod,
    SettlementRecord, SettlementStatus, Trade,
};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("vpp id must not be empty")]
    EmptyVppId,

    #[error("period {label} has not ended yet (ends {end})")]
    PeriodNotClosed {
        label: String,
        end: chrono::DateTime<Utc>,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// External carbon accounting collaborator; figures are consumed here,
/// never computed.
pub trait CarbonAccounting: Send + Sync {
    /// Carbon reduction in kg for a delivered energy volume
    fn reduction_kg(&self, delivered_volume: f64) -> f64;
}

/// Flat emission-factor accounting (kg per delivered unit)
pub struct FactorBasedCarbon {
    pub factor_kg: f64,
}

impl CarbonAccounting for FactorBasedCarbon {
    fn reduction_kg(&self, delivered_volume: f64) -> f64 {
        delivered_volume * self.factor_kg
    }
}

/// Aggregate report over one VPP's period
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerformanceReport {
    pub vpp_id: String,
    pub period: String,
    pub total_revenue: f64,
    pub total_cost: f64,
    pub net_profit: f64,
    /// net_profit / total_revenue, zero when there was no revenue
    pub profit_margin: f64,
    pub average_daily_profit: f64,
    pub trade_count: usize,
    pub trading_volume: f64,
    /// Disposal volume actually delivered to the markets
    pub delivered_volume: f64,
    /// delivered / (total capacity x period hours)
    pub capacity_factor: f64,
    pub carbon_reduction_kg: f64,
}

pub struct SettlementEngine {
    store: Arc<SqliteStore>,
    carbon: Arc<dyn CarbonAccounting>,
}

impl SettlementEngine {
    pub fn new(store: Arc<SqliteStore>, carbon: Arc<dyn CarbonAccounting>) -> Self {
        Self { store, carbon }
    }

    /// Settle one (vpp, period) pair.
    ///
    /// Already-settled pairs return the stored record as-is; an empty
    /// trade window still persists a zero record so batch reruns stay
    /// idempotent.
    pub fn execute_settlement(
        &self,
        vpp_id: &str,
        period: &SettlementPeriod,
        policy: DistributionPolicy,
    ) -> Result<SettlementRecord, SettlementError> {
        if vpp_id.trim().is_empty() {
            return Err(SettlementError::EmptyVppId);
        }
        if period.ends_after(Utc::now()) {
            return Err(SettlementError::PeriodNotClosed {
                label: period.label.clone(),
                end: period.end,
            });
        }

        if let Some(existing) = self.store.get_settlement(vpp_id, &period.label)? {
            info!(
                "Settlement {} {} already completed, returning stored record",
                vpp_id, period.label
            );
            return Ok(existing);
        }

        let trades = self.store.trades_for_vpp(vpp_id, period.start, period.end)?;
        let resources = self.store.list_resources(vpp_id)?;

        let (total_revenue, total_cost) = settle_totals(&trades);
        let net_profit = total_revenue - total_cost;

        let distributions = if net_profit > 0.0 && !resources.is_empty() {
            distribute(net_profit, policy, &resources, &trades)
        } else {
            Vec::new()
        };

        let record = SettlementRecord {
            vpp_id: vpp_id.to_string(),
            period: period.label.clone(),
            period_start: period.start,
            period_end: period.end,
            total_revenue,
            total_cost,
            net_profit,
            policy,
            distributions,
            status: SettlementStatus::Completed,
            settled_at: Utc::now(),
        };

        self.store.save_settlement(&record)?;
        info!(
            "Settled {} {}: revenue {:.2}, cost {:.2}, net {:.2} ({} trades)",
            vpp_id,
            period.label,
            total_revenue,
            total_cost,
            net_profit,
            trades.len()
        );
        Ok(record)
    }

    /// Settle many VPPs for one period. Per-vpp failures are logged and
    /// never abort the rest of the batch.
    pub fn run_batch(
        &self,
        vpp_ids: &[String],
        period: &SettlementPeriod,
        policy: DistributionPolicy,
    ) -> Vec<SettlementRecord> {
        let mut settled = Vec::new();
        for vpp_id in vpp_ids {
            match self.execute_settlement(vpp_id, period, policy) {
                Ok(record) => settled.push(record),
                Err(e) => warn!("Settlement failed for {} {}: {}", vpp_id, period.label, e),
            }
        }
        info!(
            "Settlement batch {}: {}/{} succeeded",
            period.label,
            settled.len(),
            vpp_ids.len()
        );
        settled
    }

    pub fn get_settlement_history(
        &self,
        vpp_id: &str,
    ) -> Result<Vec<SettlementRecord>, SettlementError> {
        Ok(self.store.settlement_history(vpp_id)?)
    }

    /// Resources ranked by settled cumulative profit, best first
    pub fn get_resource_profit_ranking(
        &self,
        vpp_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, SettlementError> {
        Ok(self.store.resource_profit_ranking(vpp_id, limit)?)
    }

    pub fn generate_performance_report(
        &self,
        vpp_id: &str,
        period: &SettlementPeriod,
    ) -> Result<PerformanceReport, SettlementError> {
        if vpp_id.trim().is_empty() {
            return Err(SettlementError::EmptyVppId);
        }

        let trades = self.store.trades_for_vpp(vpp_id, period.start, period.end)?;
        let resources = self.store.list_resources(vpp_id)?;

        let (total_revenue, total_cost) = settle_totals(&trades);
        let net_profit = total_revenue - total_cost;
        let profit_margin = if total_revenue > 0.0 {
            net_profit / total_revenue
        } else {
            0.0
        };

        let duration_days = period.duration_days();
        let average_daily_profit = if duration_days > 0.0 {
            net_profit / duration_days
        } else {
            0.0
        };

        let trading_volume: f64 = trades.iter().map(|t| t.quantity).sum();
        let delivered_volume: f64 = trades
            .iter()
            .filter(|t| t.side.is_disposal())
            .map(|t| t.quantity)
            .sum();

        let total_capacity: f64 = resources.iter().map(|r| r.capacity_kw).sum();
        let period_hours = duration_days * 24.0;
        let capacity_factor = if total_capacity > 0.0 && period_hours > 0.0 {
            delivered_volume / (total_capacity * period_hours)
        } else {
            0.0
        };

        Ok(PerformanceReport {
            vpp_id: vpp_id.to_string(),
            period: period.label.clone(),
            total_revenue,
            total_cost,
            net_profit,
            profit_margin,
            average_daily_profit,
            trade_count: trades.len(),
            trading_volume,
            delivered_volume,
            capacity_factor,
            carbon_reduction_kg: self.carbon.reduction_kg(delivered_volume),
        })
    }
}

/// Revenue from disposals, cost from acquisitions plus all commissions
fn settle_totals(trades: &[Trade]) -> (f64, f64) {
    let mut revenue = 0.0;
    let mut cost = 0.0;
    for trade in trades {
        if trade.side.is_disposal() {
            revenue += trade.gross_amount();
        } else {
            cost += trade.gross_amount();
        }
        cost += trade.commission;
    }
    (revenue, cost)
}

/// Split net profit across resources by policy.
///
/// Amounts are rounded to cents; the last resource absorbs the rounding
/// remainder so the amounts always reconcile with net profit.
fn distribute(
    net_profit: f64,
    policy: DistributionPolicy,
    resources: &[ResourceCapacityInfo],
    trades: &[Trade],
) -> Vec<ProfitDistribution> {
    let ratios = match policy {
        DistributionPolicy::CapacityWeighted => capacity_ratios(resources),
        DistributionPolicy::ContributionWeighted => contribution_ratios(resources, trades),
        DistributionPolicy::EqualShare => equal_ratios(resources),
    };

    let mut distributions: Vec<ProfitDistribution> = ratios
        .into_iter()
        .map(|(resource_id, ratio)| ProfitDistribution {
            resource_id,
            ratio,
            amount: round_cents(net_profit * ratio),
            method: policy,
        })
        .collect();

    if let Some((last, rest)) = distributions.split_last_mut() {
        let allocated: f64 = rest.iter().map(|d| d.amount).sum();
        last.amount = round_cents(net_profit) - round_cents(allocated);
    }

    distributions
}

fn capacity_ratios(resources: &[ResourceCapacityInfo]) -> Vec<(String, f64)> {
    let total: f64 = resources.iter().map(|r| r.capacity_kw).sum();
    if total <= 0.0 {
        return equal_ratios(resources);
    }
    resources
        .iter()
        .map(|r| (r.resource_id.clone(), r.capacity_kw / total))
        .collect()
}

/// Share of the window's traded value per resource; falls back to equal
/// shares when no resource traded.
fn contribution_ratios(
    resources: &[ResourceCapacityInfo],
    trades: &[Trade],
) -> Vec<(String, f64)> {
    let mut traded: HashMap<&str, f64> = HashMap::new();
    for trade in trades {
        if let Some(resource_id) = trade.resource_id.as_deref() {
            *traded.entry(resource_id).or_default() += trade.gross_amount();
        }
    }
    let total: f64 = resources
        .iter()
        .filter_map(|r| traded.get(r.resource_id.as_str()))
        .sum();
    if total <= 0.0 {
        return equal_ratios(resources);
    }
    resources
        .iter()
        .map(|r| {
            let share = traded.get(r.resource_id.as_str()).copied().unwrap_or(0.0);
            (r.resource_id.clone(), share / total)
        })
        .collect()
}

fn equal_ratios(resources: &[ResourceCapacityInfo]) -> Vec<(String, f64)> {
    let n = resources.len();
    resources
        .iter()
        .map(|r| (r.resource_id.clone(), 1.0 / n as f64))
        .collect()
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketId, OrderSide};
    use approx::assert_relative_eq;
    use chrono::{DateTime, TimeZone};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    fn period() -> SettlementPeriod {
        SettlementPeriod::day(chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
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

    fn trade(resource_id: &str, side: OrderSide, quantity: f64, price: f64, hour: u32) -> Trade {
        Trade {
            market_id: MarketId::new("GRID-NORTH"),
            resource_id: Some(resource_id.to_string()),
            side,
            quantity,
            price,
            commission: 0.5,
            slippage: 0.0,
            profit: None,
            timestamp: ts(hour),
        }
    }

    fn engine() -> (SettlementEngine, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = SettlementEngine::new(
            Arc::clone(&store),
            Arc::new(FactorBasedCarbon { factor_kg: 0.4 }),
        );
        (engine, store)
    }

    #[test]
    fn test_totals_split_by_side() {
        let trades = vec![
            trade("battery-7", OrderSide::Buy, 10.0, 40.0, 1),
            trade("battery-7", OrderSide::Discharge, 10.0, 55.0, 5),
        ];
        let (revenue, cost) = settle_totals(&trades);
        assert_relative_eq!(revenue, 550.0);
        // 400 acquisition + two commissions of 0.5
        assert_relative_eq!(cost, 401.0);
    }

    #[test]
    fn test_capacity_weighted_ratios() {
        let resources = vec![resource("a", 300.0), resource("b", 100.0)];
        let dists = distribute(100.0, DistributionPolicy::CapacityWeighted, &resources, &[]);
        assert_relative_eq!(dists[0].ratio, 0.75);
        assert_relative_eq!(dists[1].ratio, 0.25);
        assert_relative_eq!(dists.iter().map(|d| d.amount).sum::<f64>(), 100.0);
    }

    #[test]
    fn test_contribution_weighted_falls_back_to_equal() {
        let resources = vec![resource("a", 300.0), resource("b", 100.0)];
        let dists = distribute(
            90.0,
            DistributionPolicy::ContributionWeighted,
            &resources,
            &[],
        );
        assert_relative_eq!(dists[0].ratio, 0.5);
        assert_relative_eq!(dists[1].ratio, 0.5);
    }

    #[test]
    fn test_rounding_remainder_goes_to_last_resource() {
        let resources = vec![resource("a", 1.0), resource("b", 1.0), resource("c", 1.0)];
        let dists = distribute(100.0, DistributionPolicy::EqualShare, &resources, &[]);
        let total: f64 = dists.iter().map(|d| d.amount).sum();
        assert_relative_eq!(total, 100.0, epsilon = 1e-9);
        assert_relative_eq!(dists[0].amount, 33.33);
        assert_relative_eq!(dists[2].amount, 33.34);
    }

    #[test]
    fn test_empty_vpp_id_rejected() {
        let (engine, _) = engine();
        let result = engine.execute_settlement("  ", &period(), DistributionPolicy::EqualShare);
        assert!(matches!(result, Err(SettlementError::EmptyVppId)));
    }

    #[test]
    fn test_future_period_rejected() {
        let (engine, _) = engine();
        let future = SettlementPeriod::new(
            Utc::now(),
            Utc::now() + chrono::Duration::days(1),
            "future",
        );
        let result = engine.execute_settlement("vpp-1", &future, DistributionPolicy::EqualShare);
        assert!(matches!(result, Err(SettlementError::PeriodNotClosed { .. })));
    }

    #[test]
    fn test_empty_window_persists_zero_record() {
        let (engine, store) = engine();
        let record = engine
            .execute_settlement("vpp-1", &period(), DistributionPolicy::EqualShare)
            .unwrap();
        assert_eq!(record.net_profit, 0.0);
        assert!(record.distributions.is_empty());
        assert!(store
            .get_settlement("vpp-1", &period().label)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_settlement_is_idempotent() {
        let (engine, store) = engine();
        store.upsert_resource("vpp-1", &resource("battery-7", 500.0)).unwrap();
        store
            .record_trade(&trade("battery-7", OrderSide::Discharge, 10.0, 55.0, 5))
            .unwrap();

        let first = engine
            .execute_settlement("vpp-1", &period(), DistributionPolicy::EqualShare)
            .unwrap();
        let second = engine
            .execute_settlement("vpp-1", &period(), DistributionPolicy::EqualShare)
            .unwrap();

        assert_eq!(first.net_profit, second.net_profit);
        assert_eq!(first.settled_at, second.settled_at);
        // Cumulative profit credited exactly once
        let credited = store.cumulative_profit("battery-7").unwrap().unwrap();
        assert_relative_eq!(credited, first.net_profit, epsilon = 1e-9);
    }

    #[test]
    fn test_loss_period_has_no_distributions() {
        let (engine, store) = engine();
        store.upsert_resource("vpp-1", &resource("battery-7", 500.0)).unwrap();
        store
            .record_trade(&trade("battery-7", OrderSide::Buy, 10.0, 60.0, 1))
            .unwrap();
        store
            .record_trade(&trade("battery-7", OrderSide::Sell, 10.0, 40.0, 5))
            .unwrap();

        let record = engine
            .execute_settlement("vpp-1", &period(), DistributionPolicy::CapacityWeighted)
            .unwrap();
        assert!(record.net_profit < 0.0);
        assert!(record.distributions.is_empty());
        assert_eq!(store.cumulative_profit("battery-7").unwrap(), Some(0.0));
    }

    #[test]
    fn test_batch_continues_past_failures() {
        let (engine, store) = engine();
        store.upsert_resource("vpp-2", &resource("solar-3", 200.0)).unwrap();

        let vpps = vec!["".to_string(), "vpp-2".to_string()];
        let settled = engine.run_batch(&vpps, &period(), DistributionPolicy::EqualShare);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].vpp_id, "vpp-2");
    }

    #[test]
    fn test_performance_report() {
        let (engine, store) = engine();
        store.upsert_resource("vpp-1", &resource("battery-7", 500.0)).unwrap();
        store
            .record_trade(&trade("battery-7", OrderSide::Buy, 10.0, 40.0, 1))
            .unwrap();
        store
            .record_trade(&trade("battery-7", OrderSide::Discharge, 10.0, 55.0, 5))
            .unwrap();

        let report = engine.generate_performance_report("vpp-1", &period()).unwrap();
        assert_relative_eq!(report.total_revenue, 550.0);
        assert_relative_eq!(report.net_profit, 550.0 - 401.0);
        assert_eq!(report.trade_count, 2);
        assert_relative_eq!(report.delivered_volume, 10.0);
        assert_relative_eq!(report.carbon_reduction_kg, 4.0);
        assert_relative_eq!(
            report.capacity_factor,
            10.0 / (500.0 * 24.0),
            epsilon = 1e-12
        );
    }
}
