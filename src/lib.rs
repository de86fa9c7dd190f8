//! VPP trading core
//!
//! Energy-market trading library for virtual power plants: periodic
//! strategy scheduling, spatial/temporal arbitrage, deterministic
//! backtesting, and period settlement with profit distribution.
//!
//! # Components
//!
//! - `scheduler`: registry of running strategies driven by one tick loop
//! - `arbitrage`: price-gap detection and paired-leg execution
//! - `backtest`: replay of historical ticks through a strategy payload
//! - `settlement`: per-period profit settlement and distribution
//! - `risk` / `gateway`: pre-trade validation and order submission seams
//! - `store`: SQLite persistence for strategies, trades, and settlements

pub mod arbitrage;
pub mod backtest;
pub mod condition;
pub mod config;
pub mod gateway;
pub mod market;
pub mod risk;
pub mod scheduler;
pub mod settlement;
pub mod store;
pub mod types;

pub use config::Config;
pub use types::*;
