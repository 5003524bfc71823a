use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{StrategyMode, TradeAction, TraderId, TransactionKind};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: need {need}, available {available}")]
    InsufficientFunds { need: Decimal, available: Decimal },

    #[error("insufficient holdings of {symbol}: requested {requested}, held {held}")]
    InsufficientHoldings {
        symbol: String,
        requested: Decimal,
        held: Decimal,
    },

    #[error("no current price for {0}")]
    UnknownAsset(String),

    #[error("unknown trader {0}")]
    UnknownTrader(String),

    #[error("trader {0} already exists")]
    DuplicateTrader(String),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("price must be non-negative, got {0}")]
    InvalidPrice(Decimal),

    #[error("opening balance must be non-negative, got {0}")]
    InvalidBalance(Decimal),

    #[error("arithmetic overflow computing a monetary amount")]
    ArithmeticOverflow,

    #[error("ledger storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Storage failures abort a tick; everything else only rejects one item.
    pub fn is_storage(&self) -> bool {
        matches!(self, LedgerError::Storage(_) | LedgerError::Corrupt(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trader {
    pub id: TraderId,
    pub name: String,
    pub mode: StrategyMode,
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub trader_id: TraderId,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub kind: TransactionKind,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn value(&self) -> Result<Decimal, LedgerError> {
        self.price
            .checked_mul(self.quantity)
            .ok_or(LedgerError::ArithmeticOverflow)
    }

    /// Signed cash effect: negative for buys, positive for sells.
    pub fn cash_flow(&self) -> Result<Decimal, LedgerError> {
        let value = self.value()?;
        Ok(match self.kind {
            TransactionKind::Buy => -value,
            TransactionKind::Sell => value,
        })
    }
}

/// What happened to a plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThoughtOutcome {
    Executed,
    Held,
    Rejected,
    Failed,
}

impl ThoughtOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThoughtOutcome::Executed => "EXECUTED",
            ThoughtOutcome::Held => "HELD",
            ThoughtOutcome::Rejected => "REJECTED",
            ThoughtOutcome::Failed => "FAILED",
        }
    }
}

impl FromStr for ThoughtOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "EXECUTED" => Ok(ThoughtOutcome::Executed),
            "HELD" => Ok(ThoughtOutcome::Held),
            "REJECTED" => Ok(ThoughtOutcome::Rejected),
            "FAILED" => Ok(ThoughtOutcome::Failed),
            _ => Err(anyhow::anyhow!("Unknown thought outcome: {}", s)),
        }
    }
}

impl fmt::Display for ThoughtOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decision rationale about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewThought {
    pub mode: StrategyMode,
    pub action: TradeAction,
    pub symbol: String,
    pub quantity: Decimal,
    pub confidence: f64,
    pub reasoning: String,
    pub outcome: ThoughtOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    pub id: i64,
    pub trader_id: TraderId,
    pub mode: StrategyMode,
    pub action: TradeAction,
    pub symbol: String,
    pub quantity: Decimal,
    pub confidence: f64,
    pub reasoning: String,
    pub outcome: ThoughtOutcome,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub trader: String,
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub realized_profit: Decimal,
    pub portfolio_value: Decimal,
    pub total_equity: Decimal,
    pub holdings: BTreeMap<String, Decimal>,
    pub holdings_value: BTreeMap<String, Decimal>,
    pub realized_profit_by_symbol: BTreeMap<String, Decimal>,
}

impl PerformanceStats {
    pub fn return_pct(&self) -> Decimal {
        if self.initial_balance.is_zero() {
            return Decimal::ZERO;
        }
        (self.total_equity - self.initial_balance) / self.initial_balance * Decimal::ONE_HUNDRED
    }
}

impl fmt::Display for PerformanceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.trader)?;
        writeln!(f, "Cash balance:    ${:.2}", self.balance)?;
        writeln!(f, "Portfolio value: ${:.2}", self.portfolio_value)?;
        writeln!(f, "Total equity:    ${:.2} ({:.2}%)", self.total_equity, self.return_pct())?;
        writeln!(f, "Realized P&L:    ${:.2}", self.realized_profit)?;
        if self.holdings.is_empty() {
            writeln!(f, "Holdings:        none")?;
        } else {
            writeln!(f, "Holdings:")?;
            for (symbol, quantity) in &self.holdings {
                let value = self.holdings_value.get(symbol).copied().unwrap_or_default();
                writeln!(f, "  {:<8} {:>10} = ${:.2}", symbol, quantity, value)?;
            }
        }
        Ok(())
    }
}
