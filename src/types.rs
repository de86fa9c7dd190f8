//! Core data types shared across the trading core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for market tick data
#[derive(Debug, Error)]
pub enum TickValidationError {
    #[error("price ({0}) must be positive")]
    NonPositivePrice(f64),

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),
}

/// Market identifier using Arc<str> for cheap cloning
///
/// Market ids travel on every tick, order, position, and ledger entry.
/// Arc<str> keeps those clones O(1) instead of reallocating a String.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl MarketId {
    pub fn new(s: impl AsRef<str>) -> Self {
        MarketId(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MarketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single market data point, immutable once stored.
///
/// Source of truth for both the live scheduler/arbitrage path and
/// historical backtest replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub market_id: MarketId,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl MarketTick {
    /// Create a new tick with validation
    pub fn new(
        market_id: MarketId,
        price: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, TickValidationError> {
        let tick = Self {
            market_id,
            price,
            volume,
            timestamp,
        };
        tick.validate()?;
        Ok(tick)
    }

    /// Create a tick without validation (for trusted sources)
    pub fn new_unchecked(
        market_id: MarketId,
        price: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            market_id,
            price,
            volume,
            timestamp,
        }
    }

    pub fn validate(&self) -> Result<(), TickValidationError> {
        if self.price <= 0.0 {
            return Err(TickValidationError::NonPositivePrice(self.price));
        }
        if self.volume < 0.0 {
            return Err(TickValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }
}

/// Lifecycle of a strategy definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Draft,
    Active,
    Running,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Draft => "DRAFT",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Running => "RUNNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(StrategyStatus::Draft),
            "ACTIVE" => Some(StrategyStatus::Active),
            "RUNNING" => Some(StrategyStatus::Running),
            _ => None,
        }
    }
}

/// A strategy as stored by the external editor.
///
/// The condition/action grammar inside `payload` is consumed here, not
/// defined here; see the `condition` module for the parsed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: i64,
    pub name: String,
    pub status: StrategyStatus,
    pub market_id: MarketId,
    pub payload: serde_json::Value,
    pub last_execution_time: Option<DateTime<Utc>>,
}

/// Trade direction, including storage dispatch sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
    Charge,
    Discharge,
}

impl OrderSide {
    /// Buy and Charge acquire energy (cash out)
    pub fn is_acquisition(&self) -> bool {
        matches!(self, OrderSide::Buy | OrderSide::Charge)
    }

    /// Sell and Discharge dispose of energy (cash in)
    pub fn is_disposal(&self) -> bool {
        matches!(self, OrderSide::Sell | OrderSide::Discharge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
            OrderSide::Charge => "CHARGE",
            OrderSide::Discharge => "DISCHARGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            "CHARGE" => Some(OrderSide::Charge),
            "DISCHARGE" => Some(OrderSide::Discharge),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Failed,
}

/// An order emitted by a strategy executor or the arbitrage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingOrder {
    pub id: String,
    pub strategy_id: Option<i64>,
    pub resource_id: String,
    pub market_id: MarketId,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub status: OrderStatus,
}

impl TradingOrder {
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Outcome of submitting one order through the execution gateway.
///
/// A rejection (risk gate or connector) is an expected outcome, not an
/// error: `success` is false and `reason` says why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_price: f64,
    pub execution_amount: f64,
    pub commission: f64,
    pub reason: Option<String>,
}

impl ExecutionResult {
    pub fn filled(execution_price: f64, execution_amount: f64, commission: f64) -> Self {
        Self {
            success: true,
            execution_price,
            execution_amount,
            commission,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            execution_price: 0.0,
            execution_amount: 0.0,
            commission: 0.0,
            reason: Some(reason.into()),
        }
    }
}

/// Arbitrage opportunity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbitrageKind {
    Spatial,
    Temporal,
    CrossCommodity,
}

impl ArbitrageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbitrageKind::Spatial => "SPATIAL",
            ArbitrageKind::Temporal => "TEMPORAL",
            ArbitrageKind::CrossCommodity => "CROSS_COMMODITY",
        }
    }
}

impl std::fmt::Display for ArbitrageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected price gap, ephemeral and consumed at most once.
///
/// The id doubles as the dedup key: kind + markets + detection timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub kind: ArbitrageKind,
    pub buy_market: MarketId,
    pub sell_market: MarketId,
    pub buy_price: f64,
    pub sell_price: f64,
    pub volume: f64,
    pub profit_margin: f64,
    pub buy_time: DateTime<Utc>,
    pub sell_time: DateTime<Utc>,
}

impl ArbitrageOpportunity {
    pub fn derive_id(
        kind: ArbitrageKind,
        buy_market: &MarketId,
        sell_market: &MarketId,
        at: DateTime<Utc>,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            kind,
            buy_market,
            sell_market,
            at.timestamp_millis()
        )
    }

    /// Realized profit if both legs fill at the detected prices
    pub fn expected_profit(&self) -> f64 {
        (self.sell_price - self.buy_price) * self.volume
    }
}

/// Open position held by the backtest simulator.
///
/// Quantity never goes negative; average cost is always
/// `total_cost / quantity` while the position is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_id: MarketId,
    pub quantity: f64,
    pub total_cost: f64,
}

impl Position {
    pub fn new(market_id: MarketId) -> Self {
        Self {
            market_id,
            quantity: 0.0,
            total_cost: 0.0,
        }
    }

    pub fn average_cost(&self) -> f64 {
        if self.quantity > 0.0 {
            self.total_cost / self.quantity
        } else {
            0.0
        }
    }

    /// Weighted average cost update on buy
    pub fn add(&mut self, quantity: f64, price: f64) {
        self.total_cost += quantity * price;
        self.quantity += quantity;
    }

    /// Proportional cost reduction on sell; quantity is clamped at zero
    pub fn reduce(&mut self, quantity: f64) {
        let quantity = quantity.min(self.quantity);
        let cost_removed = quantity * self.average_cost();
        self.quantity -= quantity;
        self.total_cost -= cost_removed;
        if self.quantity <= f64::EPSILON {
            self.quantity = 0.0;
            self.total_cost = 0.0;
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity * price
    }
}

/// Append-only trade ledger entry.
///
/// `profit` is realized profit and is set on disposals only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub market_id: MarketId,
    pub resource_id: Option<String>,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub slippage: f64,
    pub profit: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    pub fn gross_amount(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Equity-curve point, one per replayed tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_assets: f64,
    pub cash: f64,
    pub market_value: f64,
    pub cumulative_return: f64,
}

/// Settlement time window with a stable label used as the idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

impl SettlementPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
        }
    }

    /// Calendar day window, labeled YYYY-MM-DD
    pub fn day(date: chrono::NaiveDate) -> Self {
        let start = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let end = start + chrono::Duration::days(1);
        Self::new(start, end, date.format("%Y-%m-%d").to_string())
    }

    /// Calendar month window, labeled YYYY-MM
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = chrono::NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc();
        let (next_y, next_m) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let end = chrono::NaiveDate::from_ymd_opt(next_y, next_m, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc();
        Some(Self::new(start, end, format!("{year:04}-{month:02}")))
    }

    pub fn duration_days(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 86_400.0
    }

    pub fn ends_after(&self, now: DateTime<Utc>) -> bool {
        self.end > now
    }
}

/// Profit distribution policy, dispatched through pure functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionPolicy {
    CapacityWeighted,
    ContributionWeighted,
    EqualShare,
}

impl DistributionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionPolicy::CapacityWeighted => "CAPACITY_WEIGHTED",
            DistributionPolicy::ContributionWeighted => "CONTRIBUTION_WEIGHTED",
            DistributionPolicy::EqualShare => "EQUAL_SHARE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CAPACITY_WEIGHTED" => Some(DistributionPolicy::CapacityWeighted),
            "CONTRIBUTION_WEIGHTED" => Some(DistributionPolicy::ContributionWeighted),
            "EQUAL_SHARE" => Some(DistributionPolicy::EqualShare),
            _ => None,
        }
    }
}

/// One resource's share of a settled period's net profit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitDistribution {
    pub resource_id: String,
    pub ratio: f64,
    pub amount: f64,
    pub method: DistributionPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    Pending,
    Completed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SettlementStatus::Pending),
            "COMPLETED" => Some(SettlementStatus::Completed),
            _ => None,
        }
    }
}

/// Immutable settlement outcome for one (vpp, period) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub vpp_id: String,
    pub period: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_revenue: f64,
    pub total_cost: f64,
    pub net_profit: f64,
    pub policy: DistributionPolicy,
    pub distributions: Vec<ProfitDistribution>,
    pub status: SettlementStatus,
    pub settled_at: DateTime<Utc>,
}

/// Aggregated capacity snapshot for one resource, consumed as input.
///
/// Recomputed by the external resource-aggregation collaborator whenever
/// the resource set backing a VPP changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCapacityInfo {
    pub resource_id: String,
    pub capacity_kw: f64,
    pub available_kw: f64,
    pub max_power_kw: f64,
    pub min_power_kw: f64,
}
