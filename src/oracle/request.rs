use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::config::OUTPUT_FORMAT;
use crate::ledger::PerformanceStats;
use crate::ml::Forecast;
use crate::sentiment::SentimentReport;
use crate::types::StrategyMode;

/// Everything the oracle sees about the market and the trader's book.
#[derive(Debug, Clone, Serialize)]
pub struct MarketContext {
    pub timestamp: DateTime<Utc>,
    pub current_prices: BTreeMap<String, Decimal>,
    pub forecasts: BTreeMap<String, Forecast>,
    /// Symbols whose forecast could not be produced this tick, with the reason.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub forecast_errors: BTreeMap<String, String>,
    pub sentiment: SentimentReport,
    /// `None` when the book could not be valued (a held symbol has no price).
    pub portfolio: Option<PerformanceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub trader: String,
    pub mode: StrategyMode,
    pub instruction: String,
    pub context: MarketContext,
}

impl DecisionRequest {
    /// Mode instruction followed by the output contract.
    pub fn system_prompt(&self) -> String {
        format!("{}\n\n{}", self.instruction, OUTPUT_FORMAT)
    }

    pub fn user_prompt(&self) -> anyhow::Result<String> {
        let mut prompt = String::new();
        writeln!(prompt, "Trader: {} ({} mode)", self.trader, self.mode)?;
        writeln!(prompt, "As of: {}", self.context.timestamp.to_rfc3339())?;
        writeln!(prompt, "\nCurrent prices:")?;
        for (symbol, price) in &self.context.current_prices {
            writeln!(prompt, "- {}: ${:.2}", symbol, price)?;
        }

        match &self.context.portfolio {
            Some(stats) => {
                writeln!(
                    prompt,
                    "\nCash ${:.2}, holdings ${:.2}, equity ${:.2}",
                    stats.balance, stats.portfolio_value, stats.total_equity
                )?;
            }
            None => writeln!(prompt, "\nPortfolio valuation unavailable this cycle.")?,
        }

        writeln!(prompt, "\nFull context (JSON):")?;
        writeln!(prompt, "{}", serde_json::to_string_pretty(&self.context)?)?;
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelKind;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn request() -> DecisionRequest {
        let forecast = Forecast::from([(ModelKind::MlpUnivariate, vec![190.0, 191.5])]);
        DecisionRequest {
            trader: "Alice".to_string(),
            mode: StrategyMode::Growth,
            instruction: "Be bold.".to_string(),
            context: MarketContext {
                timestamp: Utc::now(),
                current_prices: BTreeMap::from([("AAPL".to_string(), dec!(189.25))]),
                forecasts: BTreeMap::from([("AAPL".to_string(), forecast)]),
                forecast_errors: BTreeMap::new(),
                sentiment: BTreeMap::from([(
                    "reddit".to_string(),
                    BTreeMap::from([("AAPL".to_string(), json!({"avg_sentiment": 0.3}))]),
                )]),
                portfolio: None,
            },
        }
    }

    #[test]
    fn test_prompts_carry_instruction_and_context() {
        let request = request();
        let system = request.system_prompt();
        assert!(system.starts_with("Be bold."));
        assert!(system.contains("JSON array"));

        let user = request.user_prompt().unwrap();
        assert!(user.contains("- AAPL: $189.25"));
        assert!(user.contains("mlp_univariate"));
        assert!(user.contains("avg_sentiment"));
        assert!(user.contains("valuation unavailable"));
        assert!(!user.contains("forecast_errors"));
    }
}
