//! Strategy scheduler
//!
//! Registry of running strategy executors driven by one periodic tick.
//! The registry lock is held only while registering, deregistering, or
//! snapshotting; executor work happens outside it. Stopping is
//! cooperative: the running flag flips and in-flight submissions finish.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::condition::{ConditionParseError, StrategyPayload};
use crate::gateway::ExecutionGateway;
use crate::market::MarketDataProvider;
use crate::risk::{RiskContext, RiskGate};
use crate::store::SqliteStore;
use crate::types::{
    ExecutionResult, MarketId, OrderStatus, StrategyStatus, Trade, TradingOrder,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("strategy {0} not found")]
    NotFound(i64),

    #[error("strategy {id} is {status}, only ACTIVE strategies can start")]
    NotActive { id: i64, status: &'static str },

    #[error("strategy {id}: {source}")]
    Payload {
        id: i64,
        #[source]
        source: ConditionParseError,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// One registered strategy and its cooperative-cancellation flag
pub struct StrategyExecutor {
    pub strategy_id: i64,
    pub name: String,
    pub market_id: MarketId,
    payload: StrategyPayload,
    running: AtomicBool,
    rate: Mutex<OrderRateWindow>,
}

impl StrategyExecutor {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Sliding one-minute order counter feeding the risk gate
#[derive(Default)]
struct OrderRateWindow {
    minute: i64,
    count: u32,
}

impl OrderRateWindow {
    fn observe(&mut self, now: chrono::DateTime<Utc>) -> u32 {
        let minute = now.timestamp() / 60;
        if minute != self.minute {
            self.minute = minute;
            self.count = 0;
        }
        let before = self.count;
        self.count += 1;
        before
    }
}

/// Explicit scheduler state: executor registry plus a global kill switch
struct SchedulerState {
    executors: Mutex<HashMap<i64, Arc<StrategyExecutor>>>,
    enabled: AtomicBool,
}

pub struct StrategyScheduler {
    state: SchedulerState,
    store: Arc<SqliteStore>,
    market: Arc<dyn MarketDataProvider>,
    risk: RiskGate,
    gateway: Arc<dyn ExecutionGateway>,
    market_window: usize,
}

impl StrategyScheduler {
    pub fn new(
        store: Arc<SqliteStore>,
        market: Arc<dyn MarketDataProvider>,
        risk: RiskGate,
        gateway: Arc<dyn ExecutionGateway>,
        market_window: usize,
    ) -> Self {
        Self {
            state: SchedulerState {
                executors: Mutex::new(HashMap::new()),
                enabled: AtomicBool::new(true),
            },
            store,
            market,
            risk,
            gateway,
            market_window,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
        info!("Scheduler {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Register a strategy for periodic execution.
    ///
    /// Only ACTIVE strategies start; an already-registered id is a
    /// logged no-op.
    pub fn start_execution(&self, id: i64) -> Result<(), SchedulerError> {
        {
            let executors = self.state.executors.lock().unwrap();
            if executors.contains_key(&id) {
                info!("Strategy {} is already running, ignoring start", id);
                return Ok(());
            }
        }

        let strategy = self
            .store
            .get_strategy(id)?
            .ok_or(SchedulerError::NotFound(id))?;

        if strategy.status != StrategyStatus::Active {
            return Err(SchedulerError::NotActive {
                id,
                status: strategy.status.as_str(),
            });
        }

        let payload = StrategyPayload::parse(&strategy.payload)
            .map_err(|source| SchedulerError::Payload { id, source })?;

        let executor = Arc::new(StrategyExecutor {
            strategy_id: id,
            name: strategy.name.clone(),
            market_id: strategy.market_id.clone(),
            payload,
            running: AtomicBool::new(true),
            rate: Mutex::new(OrderRateWindow::default()),
        });

        self.state.executors.lock().unwrap().insert(id, executor);
        self.store.update_strategy_status(id, StrategyStatus::Running)?;
        info!("Strategy {} ({}) started", id, strategy.name);
        Ok(())
    }

    /// Deregister a strategy. Unregistered ids are a logged no-op.
    pub fn stop_execution(&self, id: i64) -> Result<(), SchedulerError> {
        let removed = self.state.executors.lock().unwrap().remove(&id);
        match removed {
            Some(executor) => {
                executor.running.store(false, Ordering::SeqCst);
                self.store.update_strategy_status(id, StrategyStatus::Active)?;
                info!("Strategy {} stopped", id);
            }
            None => {
                debug!("Strategy {} is not running, ignoring stop", id);
            }
        }
        Ok(())
    }

    /// Snapshot of registered strategy ids, ascending
    pub fn running_strategies(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state.executors.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// One scheduling cycle: run every registered executor, isolating
    /// failures so no executor can abort the others.
    pub async fn tick(&self) {
        if !self.is_enabled() {
            debug!("Scheduler disabled, skipping tick");
            return;
        }

        let snapshot: Vec<Arc<StrategyExecutor>> = {
            let executors = self.state.executors.lock().unwrap();
            executors.values().cloned().collect()
        };

        for executor in snapshot {
            if let Err(e) = self.execute(&executor).await {
                warn!(
                    "Strategy {} ({}) execution failed: {:#}",
                    executor.strategy_id, executor.name, e
                );
            }
        }
    }

    /// Periodic driver task
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    async fn execute(&self, executor: &StrategyExecutor) -> anyhow::Result<()> {
        if !executor.is_running() {
            return Ok(());
        }

        let ticks = self
            .market
            .latest_ticks(&executor.market_id, self.market_window)
            .await?;

        let mut submitted = 0usize;
        for tick in &ticks {
            if !executor.payload.conditions.matches(tick) {
                continue;
            }

            for action in &executor.payload.actions {
                let order = TradingOrder {
                    id: format!(
                        "{}-{}-{}",
                        executor.strategy_id,
                        tick.timestamp.timestamp_millis(),
                        submitted
                    ),
                    strategy_id: Some(executor.strategy_id),
                    resource_id: action.resource_id.clone(),
                    market_id: executor.market_id.clone(),
                    side: action.side,
                    quantity: action.quantity,
                    price: action.order_price(tick),
                    status: OrderStatus::Pending,
                };

                let orders_this_minute = executor.rate.lock().unwrap().observe(Utc::now());
                let ctx = RiskContext {
                    orders_this_minute,
                    reference_price: tick.price,
                    ..Default::default()
                };

                let result = match self.risk.validate(&order, &ctx) {
                    Ok(()) => match self.gateway.submit(&order).await {
                        Ok(result) => result,
                        Err(e) => {
                            // Transient connector failure; the rest of the
                            // batch still goes out
                            warn!("Order {} connector failure: {}", order.id, e);
                            continue;
                        }
                    },
                    Err(violation) => {
                        debug!("Order {} blocked: {}", order.id, violation);
                        ExecutionResult::rejected(violation.to_string())
                    }
                };

                submitted += 1;
                if result.success {
                    self.record_fill(&order, &result)?;
                } else {
                    debug!(
                        "Order {} not filled: {}",
                        order.id,
                        result.reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }

        self.store
            .touch_strategy_execution(executor.strategy_id, Utc::now())?;
        if submitted > 0 {
            info!(
                "Strategy {} ({}) submitted {} orders",
                executor.strategy_id, executor.name, submitted
            );
        }
        Ok(())
    }

    fn record_fill(&self, order: &TradingOrder, result: &ExecutionResult) -> anyhow::Result<()> {
        self.store.record_trade(&Trade {
            market_id: order.market_id.clone(),
            resource_id: Some(order.resource_id.clone()),
            side: order.side,
            quantity: order.quantity,
            price: result.execution_price,
            commission: result.commission,
            slippage: 0.0,
            profit: None,
            timestamp: Utc::now(),
        })
    }
}
