use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger row id of a trader.
pub type TraderId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Buy,
    Sell,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Buy => "BUY",
            TransactionKind::Sell => "SELL",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "BUY" => Ok(TransactionKind::Buy),
            "SELL" => Ok(TransactionKind::Sell),
            _ => Err(anyhow::anyhow!("Unknown transaction kind: {}", s)),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action of a single plan item proposed by the decision oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }

    pub fn is_trade(&self) -> bool {
        !matches!(self, TradeAction::Hold)
    }
}

impl FromStr for TradeAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            "HOLD" => Ok(TradeAction::Hold),
            _ => Err(anyhow::anyhow!("Unknown trade action: {}", s)),
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named decision policy selecting the oracle's instruction payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Value,
    Growth,
    Momentum,
    Defensive,
    #[serde(alias = "ideal")]
    Balanced,
}

impl StrategyMode {
    pub const ALL: [StrategyMode; 5] = [
        StrategyMode::Value,
        StrategyMode::Growth,
        StrategyMode::Momentum,
        StrategyMode::Defensive,
        StrategyMode::Balanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::Value => "value",
            StrategyMode::Growth => "growth",
            StrategyMode::Momentum => "momentum",
            StrategyMode::Defensive => "defensive",
            StrategyMode::Balanced => "balanced",
        }
    }
}

impl FromStr for StrategyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "value" => Ok(StrategyMode::Value),
            "growth" => Ok(StrategyMode::Growth),
            "momentum" => Ok(StrategyMode::Momentum),
            "defensive" => Ok(StrategyMode::Defensive),
            "balanced" | "ideal" => Ok(StrategyMode::Balanced),
            _ => Err(anyhow::anyhow!("Unknown strategy mode: {}", s)),
        }
    }
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_action_parsing_is_case_insensitive() {
        assert_eq!(TradeAction::from_str("buy").unwrap(), TradeAction::Buy);
        assert_eq!(TradeAction::from_str(" Sell ").unwrap(), TradeAction::Sell);
        assert_eq!(TradeAction::from_str("HOLD").unwrap(), TradeAction::Hold);
        assert!(TradeAction::from_str("short").is_err());
    }

    #[test]
    fn test_transaction_kind_round_trip() {
        for kind in [TransactionKind::Buy, TransactionKind::Sell] {
            assert_eq!(TransactionKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(TransactionKind::from_str("buy").is_err());
    }

    #[test]
    fn test_strategy_mode_accepts_ideal_alias() {
        assert_eq!(StrategyMode::from_str("ideal").unwrap(), StrategyMode::Balanced);
        assert_eq!(StrategyMode::from_str("Momentum").unwrap(), StrategyMode::Momentum);
        let parsed: StrategyMode = serde_json::from_str("\"ideal\"").unwrap();
        assert_eq!(parsed, StrategyMode::Balanced);
        assert!(StrategyMode::from_str("yolo").is_err());
    }
}
