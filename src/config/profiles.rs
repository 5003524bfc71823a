use std::collections::BTreeMap;

use crate::types::StrategyMode;

/// Output contract appended to every mode instruction.
pub const OUTPUT_FORMAT: &str = r#"Respond with a JSON array and nothing else. Each element must be:
{"action": "BUY" | "SELL" | "HOLD", "symbol": "TICKER", "quantity": <non-negative integer>, "confidence": <number between 0 and 1>, "reasoning": "<one or two sentences, including position sizing>"}

Weigh in every decision: current holdings and their value, realized profit by symbol, total equity and cash available, current price against each model's forecast, sentiment level and stability, concentration risk.
Never propose a SELL larger than the quantity held or a BUY costing more than the cash balance."#;

impl StrategyMode {
    /// Built-in instruction payload for this mode.
    pub fn default_instruction(&self) -> &'static str {
        match self {
            StrategyMode::Value => {
                "You manage a value portfolio. Buy only where several indicators agree: \
                 forecasts above the current price, positive but calm sentiment (low \
                 sentiment_std), no hype. Cut losing positions early, keep the book \
                 diversified and size positions small relative to equity."
            }
            StrategyMode::Growth => {
                "You manage a growth portfolio. Look for accelerating sentiment \
                 (recent sentiment above its average) and strong short-horizon upward \
                 forecasts. Add to high-conviction names when signals align, but keep \
                 any single position a modest share of total equity."
            }
            StrategyMode::Momentum => {
                "You trade momentum. Treat sentiment_std as a volatility gauge, compare \
                 the first forecast steps to the last ones to spot acceleration, and \
                 follow fast sentiment shifts. Take profits quickly and exit when \
                 momentum fades."
            }
            StrategyMode::Defensive => {
                "You protect capital first. Prefer HOLD unless forecasts and sentiment \
                 both point the same way with high confidence. Reduce exposure to \
                 volatile or underwater positions and keep a large cash reserve."
            }
            StrategyMode::Balanced => {
                "You run a balanced book. Combine forecasts, sentiment and portfolio \
                 state, trade only when the evidence is consistent, and keep risk \
                 spread across positions with sizing proportional to conviction."
            }
        }
    }
}

/// Mode to instruction payload lookup, injected into the decision loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeTable {
    instructions: BTreeMap<StrategyMode, String>,
}

impl ModeTable {
    pub fn builtin() -> Self {
        let instructions = StrategyMode::ALL
            .iter()
            .map(|mode| (*mode, mode.default_instruction().to_string()))
            .collect();
        Self { instructions }
    }

    /// Built-in table with configured overrides applied on top.
    pub fn with_overrides(overrides: &BTreeMap<StrategyMode, String>) -> Self {
        let mut table = Self::builtin();
        for (mode, text) in overrides {
            if !text.trim().is_empty() {
                table.instructions.insert(*mode, text.clone());
            }
        }
        table
    }

    pub fn instruction(&self, mode: StrategyMode) -> &str {
        self.instructions
            .get(&mode)
            .map(String::as_str)
            .unwrap_or_else(|| mode.default_instruction())
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::builtin()
    }
}
