//! Strategy condition/action payload parsing
//!
//! The grammar (threshold, range, AND-compound) is owned by the external
//! strategy editor; this module only parses and evaluates it against
//! market ticks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MarketTick, OrderSide};

#[derive(Debug, Error)]
pub enum ConditionParseError {
    #[error("malformed strategy payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("condition {index}: range min ({min}) exceeds max ({max})")]
    InvertedRange { index: usize, min: f64, max: f64 },

    #[error("action {index}: quantity ({quantity}) must be positive")]
    NonPositiveQuantity { index: usize, quantity: f64 },

    #[error("action {index}: limit price ({price}) must be positive")]
    NonPositiveLimitPrice { index: usize, price: f64 },
}

/// Tick field a condition evaluates against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickField {
    Price,
    Volume,
}

impl TickField {
    fn extract(&self, tick: &MarketTick) -> f64 {
        match self {
            TickField::Price => tick.price,
            TickField::Volume => tick.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl CompareOp {
    fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
            CompareOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }
}

/// One typed predicate over a tick field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Threshold {
        field: TickField,
        op: CompareOp,
        value: f64,
    },
    /// Inclusive on both bounds
    Range {
        field: TickField,
        min: f64,
        max: f64,
    },
}

impl Condition {
    pub fn matches(&self, tick: &MarketTick) -> bool {
        match self {
            Condition::Threshold { field, op, value } => op.apply(field.extract(tick), *value),
            Condition::Range { field, min, max } => {
                let v = field.extract(tick);
                v >= *min && v <= *max
            }
        }
    }
}

/// AND-combination of conditions.
///
/// An empty set never matches; a strategy with no conditions must not
/// fire on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet(pub Vec<Condition>);

impl ConditionSet {
    pub fn matches(&self, tick: &MarketTick) -> bool {
        !self.0.is_empty() && self.0.iter().all(|c| c.matches(tick))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Order template instantiated on every condition match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub side: OrderSide,
    pub resource_id: String,
    pub quantity: f64,
    /// None means "at the matched tick's price"
    #[serde(default)]
    pub limit_price: Option<f64>,
}

impl ActionTemplate {
    pub fn order_price(&self, tick: &MarketTick) -> f64 {
        self.limit_price.unwrap_or(tick.price)
    }
}

/// Parsed strategy payload: conditions plus action templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPayload {
    pub conditions: ConditionSet,
    pub actions: Vec<ActionTemplate>,
}

impl StrategyPayload {
    /// Parse and validate a raw payload from the strategy store
    pub fn parse(payload: &serde_json::Value) -> Result<Self, ConditionParseError> {
        let parsed: StrategyPayload = serde_json::from_value(payload.clone())?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ConditionParseError> {
        for (index, condition) in self.conditions.0.iter().enumerate() {
            if let Condition::Range { min, max, .. } = condition {
                if min > max {
                    return Err(ConditionParseError::InvertedRange {
                        index,
                        min: *min,
                        max: *max,
                    });
                }
            }
        }
        for (index, action) in self.actions.iter().enumerate() {
            if action.quantity <= 0.0 {
                return Err(ConditionParseError::NonPositiveQuantity {
                    index,
                    quantity: action.quantity,
                });
            }
            if let Some(price) = action.limit_price {
                if price <= 0.0 {
                    return Err(ConditionParseError::NonPositiveLimitPrice { index, price });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketId;
    use chrono::Utc;
    use serde_json::json;

    fn tick(price: f64, volume: f64) -> MarketTick {
        MarketTick::new_unchecked(MarketId::new("GRID-NORTH"), price, volume, Utc::now())
    }

    fn sample_payload() -> serde_json::Value {
        json!({
            "conditions": [
                { "type": "threshold", "field": "price", "op": "gte", "value": 55.0 },
                { "type": "range", "field": "volume", "min": 10.0, "max": 500.0 }
            ],
            "actions": [
                { "side": "Discharge", "resource_id": "battery-7", "quantity": 5.0 }
            ]
        })
    }

    #[test]
    fn test_parse_and_match() {
        let payload = StrategyPayload::parse(&sample_payload()).unwrap();
        assert!(payload.conditions.matches(&tick(60.0, 100.0)));
        assert!(!payload.conditions.matches(&tick(54.9, 100.0)));
        assert!(!payload.conditions.matches(&tick(60.0, 501.0)));
    }

    #[test]
    fn test_threshold_is_inclusive_on_gte() {
        let payload = StrategyPayload::parse(&sample_payload()).unwrap();
        assert!(payload.conditions.matches(&tick(55.0, 100.0)));
    }

    #[test]
    fn test_empty_condition_set_never_matches() {
        let set = ConditionSet(vec![]);
        assert!(!set.matches(&tick(60.0, 100.0)));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let bad = json!({
            "conditions": [
                { "type": "range", "field": "price", "min": 100.0, "max": 50.0 }
            ],
            "actions": []
        });
        assert!(matches!(
            StrategyPayload::parse(&bad),
            Err(ConditionParseError::InvertedRange { .. })
        ));
    }

    #[test]
    fn test_non_positive_quantity_rejected() {
        let bad = json!({
            "conditions": [
                { "type": "threshold", "field": "price", "op": "gt", "value": 1.0 }
            ],
            "actions": [
                { "side": "Buy", "resource_id": "battery-7", "quantity": 0.0 }
            ]
        });
        assert!(matches!(
            StrategyPayload::parse(&bad),
            Err(ConditionParseError::NonPositiveQuantity { .. })
        ));
    }

    #[test]
    fn test_action_price_defaults_to_tick() {
        let action = ActionTemplate {
            side: OrderSide::Buy,
            resource_id: "battery-7".to_string(),
            quantity: 2.0,
            limit_price: None,
        };
        assert_eq!(action.order_price(&tick(42.0, 1.0)), 42.0);
    }
}
