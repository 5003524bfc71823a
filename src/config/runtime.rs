use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::ml::ModelKind;
use crate::types::StrategyMode;

pub const ENV_PREFIX: &str = "BOT";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralSettings,
    pub forecast: ForecastSettings,
    pub decision: DecisionSettings,
    pub oracle: OracleSettings,
    pub traders: Vec<TraderSettings>,
    /// Per-mode instruction overrides merged onto the built-in table.
    pub modes: BTreeMap<StrategyMode, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            general: GeneralSettings::default(),
            forecast: ForecastSettings::default(),
            decision: DecisionSettings::default(),
            oracle: OracleSettings::default(),
            traders: vec![TraderSettings::default()],
            modes: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Layer `path` (if present) and `BOT_*` environment variables over the
    /// defaults. Environment keys use `__` between section and field, e.g.
    /// `BOT_DECISION__MIN_CONFIDENCE=0.7`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("general.symbols")
                    .with_list_parse_key("forecast.model_kinds"),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        if config.oracle.api_key.is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                config.oracle.api_key = key;
            }
        }
        config.normalize_symbols();
        Ok(config)
    }

    /// Tickers are matched case-sensitively against feed and oracle output,
    /// so store them trimmed, uppercase and without repeats.
    fn normalize_symbols(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.general.symbols = self
            .general
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| s.is_empty() || seen.insert(s.clone()))
            .collect();
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // General validation
        if self.general.symbols.is_empty() {
            errors.push("at least one symbol must be configured".to_string());
        }
        if self.general.symbols.iter().any(|s| s.trim().is_empty()) {
            errors.push("symbols must not be blank".to_string());
        }
        if self.general.interval_minutes == 0 {
            errors.push("interval_minutes must be > 0".to_string());
        }

        // Forecast validation
        if self.forecast.window_size == 0 {
            errors.push("window_size must be >= 1".to_string());
        }
        if self.forecast.horizon == 0 {
            errors.push("horizon must be >= 1".to_string());
        }
        if self.forecast.ttl_minutes <= 0 {
            errors.push("ttl_minutes must be > 0".to_string());
        }
        if self.forecast.model_kinds.is_empty() {
            errors.push("at least one model kind must be enabled".to_string());
        }

        // Decision validation
        if !(0.0..=1.0).contains(&self.decision.min_confidence) {
            errors.push("min_confidence must be between 0 and 1".to_string());
        }

        // Oracle validation
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            errors.push("oracle temperature must be between 0 and 2".to_string());
        }
        if self.oracle.timeout_secs == 0 {
            errors.push("oracle timeout_secs must be > 0".to_string());
        }

        // Trader validation
        let mut names = HashSet::new();
        for trader in &self.traders {
            if trader.name.trim().is_empty() {
                errors.push("trader names must not be blank".to_string());
            }
            if !names.insert(trader.name.as_str()) {
                errors.push(format!("trader {} is configured twice", trader.name));
            }
            if trader.initial_balance < Decimal::ZERO {
                errors.push(format!("trader {}: initial_balance must be >= 0", trader.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub symbols: Vec<String>,
    pub interval_minutes: u64,
    pub database_url: String,
    pub models_dir: String,
    /// JSON sentiment snapshot read every tick, if set.
    pub sentiment_file: Option<String>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            symbols: ["AAPL", "AMZN", "GOOGL", "MSFT", "TSLA", "NVDA"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            interval_minutes: 60,
            database_url: "sqlite:./trading_ledger.db".to_string(),
            models_dir: "./models".to_string(),
            sentiment_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    pub window_size: usize,
    pub horizon: usize,
    pub ttl_minutes: i64,
    pub history_interval: String,
    pub history_range: String,
    pub model_kinds: Vec<ModelKind>,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            window_size: 6,
            horizon: 7,
            ttl_minutes: 120,
            history_interval: "1h".to_string(),
            history_range: "2y".to_string(),
            model_kinds: ModelKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionSettings {
    pub min_confidence: f64,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self { min_confidence: 0.60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    #[serde(skip_serializing)]
    pub api_key: String,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.4,
            timeout_secs: 60,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderSettings {
    pub name: String,
    pub mode: StrategyMode,
    pub initial_balance: Decimal,
}

impl Default for TraderSettings {
    fn default() -> Self {
        Self {
            name: "Alice".to_string(),
            mode: StrategyMode::Balanced,
            initial_balance: dec!(100000),
        }
    }
}
