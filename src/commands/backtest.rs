//! Backtest command implementation

use anyhow::{Context, Result};
use tracing::info;
use vpp_trading::backtest::BacktestSimulator;
use vpp_trading::condition::StrategyPayload;
use vpp_trading::{market, Config, MarketId};

pub fn run(
    config_path: String,
    market_name: String,
    ticks_override: Option<String>,
    capital_override: Option<f64>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(capital) = capital_override {
        info!("Overriding initial capital to: {:.2}", capital);
        config.trading.initial_capital = capital;
    }

    if config.trading.initial_capital <= 0.0 {
        anyhow::bail!(
            "initial capital must be positive, got {}",
            config.trading.initial_capital
        );
    }

    let market_id = MarketId::new(&market_name);
    let ticks_path = ticks_override
        .unwrap_or_else(|| format!("{}/{}.csv", config.backtest.data_dir, market_name));

    info!("Loading ticks from: {}", ticks_path);
    let ticks = market::load_csv(&ticks_path, &market_id)?;
    info!("Loaded {} ticks for {}", ticks.len(), market_id);

    let payload = StrategyPayload::parse(&config.strategy)
        .context("Config strategy section is malformed")?;

    let mut simulator = BacktestSimulator::new(
        config.trading.initial_capital,
        config.trading.commission_rate,
        config.trading.slippage_rate,
    );

    info!("Running backtest...");
    simulator.replay(&payload, &ticks);
    let report = simulator.into_report();

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    {:.2}", report.initial_capital);
    println!("Final Cash:         {:.2}", report.final_cash);
    println!("Total Return:       {:.2}%", report.metrics.total_return * 100.0);
    println!("Max Drawdown:       {:.2}%", report.metrics.max_drawdown * 100.0);
    println!("Win Rate:           {:.2}%", report.metrics.win_rate * 100.0);
    println!("Return/Volatility:  {:.3}", report.metrics.return_volatility_ratio);
    println!("Total Trades:       {}", report.metrics.total_trades);
    println!("Closing Trades:     {}", report.metrics.total_sells);
    println!("Winning Trades:     {}", report.metrics.profitable_sells);
    println!("Average Profit:     {:.2}", report.metrics.average_profit);
    println!("Average Loss:       {:.2}", report.metrics.average_loss);
    println!("Max Win Streak:     {}", report.metrics.max_consecutive_wins);
    println!("Max Loss Streak:    {}", report.metrics.max_consecutive_losses);
    println!("{}", "=".repeat(60));

    info!("Backtest completed successfully");
    Ok(())
}
