use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

use crate::types::TradeAction;

#[derive(Debug, Error)]
pub enum MalformedPlanError {
    #[error("reply contains no JSON plan")]
    NoJson,

    #[error("plan is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plan item {index}: {reason}")]
    Item { index: usize, reason: String },
}

/// One proposed action, already schema-checked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanItem {
    pub action: TradeAction,
    pub symbol: String,
    pub quantity: Decimal,
    pub confidence: f64,
    pub reasoning: String,
}

/// Ordered list of proposals for one trader and one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub items: Vec<PlanItem>,
}

impl Plan {
    pub fn new(items: Vec<PlanItem>) -> Self {
        Self { items }
    }

    /// Synthetic plan used when the oracle cannot be reached or understood:
    /// HOLD every tracked symbol with zero confidence.
    pub fn hold_all(symbols: &[String], reason: &str) -> Self {
        let items = symbols
            .iter()
            .map(|symbol| PlanItem {
                action: TradeAction::Hold,
                symbol: symbol.clone(),
                quantity: Decimal::ZERO,
                confidence: 0.0,
                reasoning: reason.to_string(),
            })
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawPlanItem {
    action: Option<String>,
    #[serde(alias = "stock", alias = "ticker")]
    symbol: Option<String>,
    quantity: Option<Value>,
    confidence: Option<Value>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Slice out the outermost JSON array, or failing that a single object.
/// Models like to wrap the payload in prose or code fences.
fn extract_json(text: &str) -> Option<&str> {
    let bracketed = |open: char, close: char| {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        (end > start).then(|| &text[start..=end])
    };
    bracketed('[', ']').or_else(|| bracketed('{', '}'))
}

fn number(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn item(index: usize, raw: RawPlanItem) -> Result<PlanItem, MalformedPlanError> {
    let fail = |reason: String| MalformedPlanError::Item { index, reason };

    let action_text = raw.action.ok_or_else(|| fail("missing action".to_string()))?;
    let action = TradeAction::from_str(&action_text)
        .map_err(|_| fail(format!("unknown action {:?}", action_text)))?;

    let symbol = raw
        .symbol
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| fail("missing symbol".to_string()))?;

    let quantity = match (&raw.quantity, action) {
        (None, TradeAction::Hold) | (Some(Value::Null), TradeAction::Hold) => Decimal::ZERO,
        (None, _) | (Some(Value::Null), _) => return Err(fail(format!("{} without quantity", action))),
        (Some(value), _) => {
            number(value).ok_or_else(|| fail(format!("quantity {} is not a number", value)))?
        }
    };
    if quantity.is_sign_negative() && !quantity.is_zero() {
        return Err(fail(format!("negative quantity {}", quantity)));
    }

    let confidence = raw
        .confidence
        .as_ref()
        .and_then(Value::as_f64)
        .ok_or_else(|| fail("missing or non-numeric confidence".to_string()))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(fail(format!("confidence {} outside [0, 1]", confidence)));
    }

    Ok(PlanItem {
        action,
        symbol,
        quantity,
        confidence,
        reasoning: raw.reasoning.unwrap_or_default(),
    })
}

/// Parse an oracle reply into a plan. Any item that violates the schema
/// rejects the whole reply.
pub fn parse_plan(text: &str) -> Result<Plan, MalformedPlanError> {
    let json = extract_json(text).ok_or(MalformedPlanError::NoJson)?;
    let value: Value = serde_json::from_str(json)?;

    let raw_items: Vec<RawPlanItem> = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(_) => vec![serde_json::from_value(value)?],
        _ => return Err(MalformedPlanError::NoJson),
    };

    let items = raw_items
        .into_iter()
        .enumerate()
        .map(|(index, raw)| item(index, raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Plan::new(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parses_plain_array() {
        let plan = parse_plan(
            r#"[{"action": "BUY", "stock": "aapl", "quantity": 5, "confidence": 0.8, "reasoning": "forecast up"},
                {"action": "hold", "symbol": "MSFT", "quantity": 0, "confidence": 0.5, "reasoning": "flat"}]"#,
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.items[0].action, TradeAction::Buy);
        assert_eq!(plan.items[0].symbol, "AAPL");
        assert_eq!(plan.items[0].quantity, dec!(5));
        assert_eq!(plan.items[1].action, TradeAction::Hold);
    }

    #[test]
    fn test_tolerates_prose_and_fences() {
        let reply = "Here is my plan:\n```json\n[{\"action\": \"SELL\", \"symbol\": \"TSLA\", \"quantity\": \"2\", \"confidence\": 0.65, \"reasoning\": \"take profit\"}]\n```\nGood luck!";
        let plan = parse_plan(reply).unwrap();
        assert_eq!(plan.items[0].action, TradeAction::Sell);
        assert_eq!(plan.items[0].quantity, dec!(2));
    }

    #[test]
    fn test_single_object_is_one_item() {
        let plan = parse_plan(r#"{"action": "HOLD", "symbol": "NVDA", "confidence": 0.9}"#).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.items[0].quantity, Decimal::ZERO);
        assert_eq!(plan.items[0].reasoning, "");
    }

    #[test]
    fn test_empty_array_is_an_empty_plan() {
        assert!(parse_plan("[]").unwrap().is_empty());
    }

    #[test]
    fn test_schema_violations_reject_the_whole_plan() {
        let cases = [
            r#"[{"action": "SHORT", "symbol": "X", "quantity": 1, "confidence": 0.9}]"#,
            r#"[{"action": "BUY", "quantity": 1, "confidence": 0.9}]"#,
            r#"[{"action": "BUY", "symbol": "X", "quantity": -3, "confidence": 0.9}]"#,
            r#"[{"action": "BUY", "symbol": "X", "quantity": 1, "confidence": 1.4}]"#,
            r#"[{"action": "BUY", "symbol": "X", "confidence": 0.9}]"#,
            r#"[{"action": "HOLD", "symbol": "X", "quantity": 0, "confidence": 0.9},
                {"action": "SELL", "symbol": "Y", "quantity": "lots", "confidence": 0.9}]"#,
        ];
        for case in cases {
            assert!(
                matches!(parse_plan(case), Err(MalformedPlanError::Item { .. })),
                "accepted: {}",
                case
            );
        }
    }

    #[test]
    fn test_unparsable_reply() {
        assert!(matches!(parse_plan("I cannot help with that."), Err(MalformedPlanError::NoJson)));
        assert!(matches!(parse_plan("[{\"action\": }]"), Err(MalformedPlanError::Json(_))));
    }

    #[test]
    fn test_hold_all_covers_every_symbol() {
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let plan = Plan::hold_all(&symbols, "oracle unavailable");
        assert_eq!(plan.len(), 2);
        assert!(plan
            .items
            .iter()
            .all(|i| i.action == TradeAction::Hold && i.confidence == 0.0 && i.quantity.is_zero()));
    }
}
