//! Settle command implementation

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use vpp_trading::settlement::{FactorBasedCarbon, SettlementEngine};
use vpp_trading::store::SqliteStore;
use vpp_trading::{Config, DistributionPolicy, SettlementPeriod};

pub fn run(
    db_path: String,
    vpp_id: String,
    period_label: String,
    policy_override: Option<String>,
    config_path: String,
) -> Result<()> {
    info!("Starting settlement for {} {}", vpp_id, period_label);

    let config = Config::from_file(&config_path).unwrap_or_default();

    let policy_name = policy_override.unwrap_or(config.settlement.default_policy);
    let policy = DistributionPolicy::parse(&policy_name)
        .with_context(|| format!("Unknown distribution policy: {policy_name}"))?;

    let period = parse_period(&period_label)?;

    let store = Arc::new(SqliteStore::new(&db_path)?);
    let engine = SettlementEngine::new(
        store,
        Arc::new(FactorBasedCarbon {
            factor_kg: config.settlement.carbon_factor_kg,
        }),
    );

    let record = engine.execute_settlement(&vpp_id, &period, policy)?;

    println!("\n{}", "=".repeat(60));
    println!("SETTLEMENT {} / {}", record.vpp_id, record.period);
    println!("{}", "=".repeat(60));
    println!("Window:             {} .. {}", record.period_start, record.period_end);
    println!("Total Revenue:      {:.2}", record.total_revenue);
    println!("Total Cost:         {:.2}", record.total_cost);
    println!("Net Profit:         {:.2}", record.net_profit);
    println!("Policy:             {}", record.policy.as_str());
    println!("Status:             {}", record.status.as_str());
    for dist in &record.distributions {
        println!(
            "  {:<24} ratio {:.4}  amount {:.2}",
            dist.resource_id, dist.ratio, dist.amount
        );
    }
    println!("{}", "=".repeat(60));

    info!("Settlement completed successfully");
    Ok(())
}

/// YYYY-MM-DD settles a day, YYYY-MM settles a month
fn parse_period(label: &str) -> Result<SettlementPeriod> {
    if let Ok(date) = chrono::NaiveDate::parse_from_str(label, "%Y-%m-%d") {
        return Ok(SettlementPeriod::day(date));
    }
    if let Some((year, month)) = label.split_once('-') {
        if let (Ok(year), Ok(month)) = (year.parse::<i32>(), month.parse::<u32>()) {
            if let Some(period) = SettlementPeriod::month(year, month) {
                return Ok(period);
            }
        }
    }
    anyhow::bail!("Invalid period label: {label} (expected YYYY-MM-DD or YYYY-MM)")
}
