//! Market data access
//!
//! The `MarketDataProvider` trait is the seam to the external
//! market-data collaborator; the live connector and the historical
//! store both sit behind it. An in-memory provider backs tests and
//! CSV-driven backtests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{MarketId, MarketTick};

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("unknown market: {0}")]
    UnknownMarket(String),

    #[error("market data unavailable: {0}")]
    Unavailable(String),
}

/// Time-ordered tick source, live or historical
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent `limit` ticks for a market, ascending by time
    async fn latest_ticks(
        &self,
        market: &MarketId,
        limit: usize,
    ) -> Result<Vec<MarketTick>, MarketDataError>;

    /// Ticks in `[start, end)`, ascending by time
    async fn ticks_between(
        &self,
        market: &MarketId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MarketTick>, MarketDataError>;
}

/// In-memory tick store keyed by market, kept sorted ascending
#[derive(Default)]
pub struct InMemoryMarketData {
    ticks: RwLock<HashMap<MarketId, Vec<MarketTick>>>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tick: MarketTick) {
        let mut guard = self.ticks.write().unwrap();
        let series = guard.entry(tick.market_id.clone()).or_default();
        series.push(tick);
        // Appends are usually already in order; sort only when they are not
        if series.len() >= 2 {
            let n = series.len();
            if series[n - 2].timestamp > series[n - 1].timestamp {
                series.sort_by_key(|t| t.timestamp);
            }
        }
    }

    pub fn extend(&self, ticks: impl IntoIterator<Item = MarketTick>) {
        for tick in ticks {
            self.push(tick);
        }
    }

    pub fn markets(&self) -> Vec<MarketId> {
        self.ticks.read().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl MarketDataProvider for InMemoryMarketData {
    async fn latest_ticks(
        &self,
        market: &MarketId,
        limit: usize,
    ) -> Result<Vec<MarketTick>, MarketDataError> {
        let guard = self.ticks.read().unwrap();
        let series = guard
            .get(market)
            .ok_or_else(|| MarketDataError::UnknownMarket(market.to_string()))?;
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn ticks_between(
        &self,
        market: &MarketId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MarketTick>, MarketDataError> {
        let guard = self.ticks.read().unwrap();
        let series = guard
            .get(market)
            .ok_or_else(|| MarketDataError::UnknownMarket(market.to_string()))?;
        Ok(series
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp < end)
            .cloned()
            .collect())
    }
}

// =============================================================================
// CSV Tick Loading
// =============================================================================

/// Load ticks for one market from a CSV file (timestamp,price,volume)
pub fn load_csv(path: impl AsRef<Path>, market: &MarketId) -> Result<Vec<MarketTick>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut ticks = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let ts_str = record.get(0).context("Missing timestamp column")?;
        let timestamp = ts_str
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(ts_str, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
            })
            .context(format!("Failed to parse timestamp: {ts_str}"))?;

        let price: f64 = record
            .get(1)
            .context("Missing price column")?
            .parse()
            .context("Failed to parse price")?;
        let volume: f64 = record
            .get(2)
            .context("Missing volume column")?
            .parse()
            .context("Failed to parse volume")?;

        let tick = MarketTick::new(market.clone(), price, volume, timestamp)
            .with_context(|| format!("Invalid tick at row {}", row_idx + 1))?;
        ticks.push(tick);
    }

    ticks.sort_by_key(|t| t.timestamp);
    Ok(ticks)
}

/// Load ticks for multiple markets from `{market}.csv` files under a directory
pub fn load_multi_market(
    data_dir: impl AsRef<Path>,
    markets: &[MarketId],
) -> Result<HashMap<MarketId, Vec<MarketTick>>> {
    let mut data = HashMap::new();

    for market in markets {
        let path = data_dir.as_ref().join(format!("{}.csv", market.as_str()));

        if !path.exists() {
            warn!("Tick file not found: {}", path.display());
            continue;
        }

        let ticks =
            load_csv(&path, market).context(format!("Failed to load ticks for {market}"))?;

        info!("Loaded {} ticks for {}", ticks.len(), market);
        data.insert(market.clone(), ticks);
    }

    if data.is_empty() {
        anyhow::bail!("No tick data loaded for any market");
    }

    Ok(data)
}
