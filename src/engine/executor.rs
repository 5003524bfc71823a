use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::LoopController;
use crate::ledger::{LedgerError, NewThought, PortfolioLedger, ThoughtOutcome, Trader};
use crate::oracle::{Plan, PlanItem};
use crate::types::TradeAction;

/// What happened to one plan item, as recorded in its thought.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub outcome: ThoughtOutcome,
    pub detail: String,
}

impl ItemOutcome {
    fn new(outcome: ThoughtOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: detail.into(),
        }
    }

    fn rejected(detail: impl Into<String>) -> Self {
        Self::new(ThoughtOutcome::Rejected, detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub executed: usize,
    pub held: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Items never looked at because the loop was stopped mid-plan.
    pub skipped: usize,
}

impl ExecutionReport {
    fn count(&mut self, outcome: ThoughtOutcome) {
        match outcome {
            ThoughtOutcome::Executed => self.executed += 1,
            ThoughtOutcome::Held => self.held += 1,
            ThoughtOutcome::Rejected => self.rejected += 1,
            ThoughtOutcome::Failed => self.failed += 1,
        }
    }

    pub fn recorded(&self) -> usize {
        self.executed + self.held + self.rejected + self.failed
    }
}

/// Validates, applies and records the items of one trader's plan.
///
/// Every item ends as exactly one thought. Only storage failures escape;
/// they abort the rest of the plan.
pub struct PlanExecutor {
    ledger: Arc<PortfolioLedger>,
    controller: Arc<LoopController>,
    min_confidence: f64,
}

impl PlanExecutor {
    pub fn new(ledger: Arc<PortfolioLedger>, controller: Arc<LoopController>, min_confidence: f64) -> Self {
        Self {
            ledger,
            controller,
            min_confidence,
        }
    }

    pub async fn execute(
        &self,
        trader: &Trader,
        plan: &Plan,
        prices: &BTreeMap<String, Decimal>,
    ) -> Result<ExecutionReport, LedgerError> {
        let mut report = ExecutionReport::default();

        for (index, item) in plan.items.iter().enumerate() {
            if !self.controller.should_continue() {
                report.skipped = plan.len() - index;
                warn!(
                    "Loop stopped, skipping {} remaining item(s) for {}",
                    report.skipped, trader.name
                );
                break;
            }

            let outcome = match self.validate(trader, item, prices).await? {
                Ok(price) => self.apply(trader, item, price).await?,
                Err(outcome) => outcome,
            };

            self.ledger
                .record_thought(
                    trader.id,
                    NewThought {
                        mode: trader.mode,
                        action: item.action,
                        symbol: item.symbol.clone(),
                        quantity: item.quantity,
                        confidence: item.confidence,
                        reasoning: item.reasoning.clone(),
                        outcome: outcome.outcome,
                        detail: outcome.detail.clone(),
                    },
                )
                .await?;
            report.count(outcome.outcome);
        }

        Ok(report)
    }

    /// Either the execution price for a trade, or the final outcome for an
    /// item that must not touch the ledger.
    async fn validate(
        &self,
        trader: &Trader,
        item: &PlanItem,
        prices: &BTreeMap<String, Decimal>,
    ) -> Result<Result<Decimal, ItemOutcome>, LedgerError> {
        if !item.action.is_trade() {
            return Ok(Err(ItemOutcome::new(ThoughtOutcome::Held, "hold, no ledger change")));
        }

        if item.confidence < self.min_confidence {
            debug!(
                "{} {} {} below confidence threshold ({:.2} < {:.2})",
                trader.name, item.action, item.symbol, item.confidence, self.min_confidence
            );
            return Ok(Err(ItemOutcome::rejected(format!(
                "confidence {:.2} below threshold {:.2}",
                item.confidence, self.min_confidence
            ))));
        }

        if item.quantity <= Decimal::ZERO {
            return Ok(Err(ItemOutcome::rejected(format!(
                "{} requires a positive quantity, got {}",
                item.action, item.quantity
            ))));
        }

        let Some(price) = prices.get(&item.symbol).copied() else {
            return Ok(Err(ItemOutcome::rejected(
                LedgerError::UnknownAsset(item.symbol.clone()).to_string(),
            )));
        };

        if item.action == TradeAction::Sell {
            let held = self
                .ledger
                .holdings(trader.id)
                .await?
                .get(&item.symbol)
                .copied()
                .unwrap_or_default();
            if item.quantity > held {
                return Ok(Err(ItemOutcome::rejected(
                    LedgerError::InsufficientHoldings {
                        symbol: item.symbol.clone(),
                        requested: item.quantity,
                        held,
                    }
                    .to_string(),
                )));
            }
        }

        Ok(Ok(price))
    }

    async fn apply(&self, trader: &Trader, item: &PlanItem, price: Decimal) -> Result<ItemOutcome, LedgerError> {
        let result = match item.action {
            TradeAction::Buy => self.ledger.buy(trader.id, &item.symbol, item.quantity, price).await,
            TradeAction::Sell => self.ledger.sell(trader.id, &item.symbol, item.quantity, price).await,
            TradeAction::Hold => {
                return Ok(ItemOutcome::new(ThoughtOutcome::Held, "hold, no ledger change"))
            }
        };

        match result {
            Ok(transaction) => {
                self.controller.increment_trades();
                info!(
                    "{} executed {} {} {} @ {}",
                    trader.name, transaction.kind, transaction.quantity, transaction.symbol, transaction.price
                );
                Ok(ItemOutcome::new(
                    ThoughtOutcome::Executed,
                    format!(
                        "{} {} @ {} (transaction {})",
                        transaction.kind, transaction.quantity, transaction.price, transaction.id
                    ),
                ))
            }
            Err(e) if e.is_storage() => Err(e),
            Err(e) => {
                warn!("{} {} {} failed at apply: {}", trader.name, item.action, item.symbol, e);
                Ok(ItemOutcome::new(ThoughtOutcome::Failed, e.to_string()))
            }
        }
    }
}
