pub mod models;

pub use models::*;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{StrategyMode, TradeAction, TraderId, TransactionKind};

type LedgerResult<T> = Result<T, LedgerError>;

/// Append-only store of trader balances, trades and decision rationale.
///
/// Balances only change through [`PortfolioLedger::buy`] and
/// [`PortfolioLedger::sell`], each of which updates the balance and appends
/// the transaction inside one SQL transaction. Writes are serialised by an
/// in-process lock.
pub struct PortfolioLedger {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl PortfolioLedger {
    /// Open (creating if missing) the ledger at `database_url`.
    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        info!("Opening portfolio ledger at: {}", database_url);
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let ledger = Self::with_pool(pool);
        ledger.create_schema().await?;
        Ok(ledger)
    }

    /// Private in-memory ledger. A single pinned connection keeps the
    /// database alive for the lifetime of the pool.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self::with_pool(pool);
        ledger.create_schema().await?;
        Ok(ledger)
    }

    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    async fn create_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                mode TEXT NOT NULL,
                balance TEXT NOT NULL,
                initial_balance TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id INTEGER NOT NULL REFERENCES traders(id),
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('BUY', 'SELL')),
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_trader ON transactions(trader_id, symbol)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS thoughts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id INTEGER NOT NULL REFERENCES traders(id),
                mode TEXT NOT NULL,
                action TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                confidence REAL NOT NULL,
                reasoning TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_thoughts_trader ON thoughts(trader_id, id DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- traders ----

    pub async fn create_trader(
        &self,
        name: &str,
        mode: StrategyMode,
        initial_balance: Decimal,
    ) -> LedgerResult<Trader> {
        if initial_balance.is_sign_negative() {
            return Err(LedgerError::InvalidBalance(initial_balance));
        }
        let _guard = self.write_lock.lock().await;

        if self.find_trader(name).await?.is_some() {
            return Err(LedgerError::DuplicateTrader(name.to_string()));
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO traders (name, mode, balance, initial_balance, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(mode.as_str())
        .bind(initial_balance.to_string())
        .bind(initial_balance.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("Created trader {} ({}) with balance {}", name, mode, initial_balance);
        Ok(Trader {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            mode,
            balance: initial_balance,
            initial_balance,
            created_at,
        })
    }

    pub async fn find_trader(&self, name: &str) -> LedgerResult<Option<Trader>> {
        let row = sqlx::query(
            "SELECT id, name, mode, balance, initial_balance, created_at FROM traders WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(trader_from_row).transpose()
    }

    pub async fn trader(&self, id: TraderId) -> LedgerResult<Trader> {
        let row = sqlx::query(
            "SELECT id, name, mode, balance, initial_balance, created_at FROM traders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::UnknownTrader(id.to_string()))?;

        trader_from_row(&row)
    }

    pub async fn list_traders(&self) -> LedgerResult<Vec<Trader>> {
        let rows = sqlx::query(
            "SELECT id, name, mode, balance, initial_balance, created_at FROM traders ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trader_from_row).collect()
    }

    // ---- trades ----

    /// Debit `price * quantity` and append a BUY. No-op on any error.
    pub async fn buy(
        &self,
        trader: TraderId,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> LedgerResult<Transaction> {
        validate_trade(quantity, price)?;
        let cost = price
            .checked_mul(quantity)
            .ok_or(LedgerError::ArithmeticOverflow)?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let balance = balance_in(&mut tx, trader).await?;
        if cost > balance {
            return Err(LedgerError::InsufficientFunds {
                need: cost,
                available: balance,
            });
        }

        let new_balance = balance - cost;
        let transaction = append_trade(
            &mut tx,
            trader,
            symbol,
            quantity,
            price,
            TransactionKind::Buy,
            new_balance,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Trader {} bought {} {} @ {} (balance {} -> {})",
            trader, quantity, symbol, price, balance, new_balance
        );
        Ok(transaction)
    }

    /// Credit `price * quantity` and append a SELL. No-op on any error.
    pub async fn sell(
        &self,
        trader: TraderId,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> LedgerResult<Transaction> {
        validate_trade(quantity, price)?;
        let proceeds = price
            .checked_mul(quantity)
            .ok_or(LedgerError::ArithmeticOverflow)?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let balance = balance_in(&mut tx, trader).await?;
        let held = holding_in(&mut tx, trader, symbol).await?;
        if quantity > held {
            return Err(LedgerError::InsufficientHoldings {
                symbol: symbol.to_string(),
                requested: quantity,
                held,
            });
        }

        let new_balance = balance
            .checked_add(proceeds)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let transaction = append_trade(
            &mut tx,
            trader,
            symbol,
            quantity,
            price,
            TransactionKind::Sell,
            new_balance,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Trader {} sold {} {} @ {} (balance {} -> {})",
            trader, quantity, symbol, price, balance, new_balance
        );
        Ok(transaction)
    }

    /// Full trade history, oldest first.
    pub async fn transactions(&self, trader: TraderId) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trader_id, symbol, quantity, price, kind, timestamp
            FROM transactions
            WHERE trader_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(trader)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    /// Net position per symbol; symbols with nothing left are omitted.
    pub async fn holdings(&self, trader: TraderId) -> LedgerResult<BTreeMap<String, Decimal>> {
        let transactions = self.transactions(trader).await?;
        Ok(net_holdings(&transactions))
    }

    /// Sum of sell proceeds minus sum of buy costs, not lot-matched.
    pub async fn realized_profit(&self, trader: TraderId) -> LedgerResult<Decimal> {
        let transactions = self.transactions(trader).await?;
        realized(&transactions)
    }

    pub async fn realized_profit_by_symbol(
        &self,
        trader: TraderId,
    ) -> LedgerResult<BTreeMap<String, Decimal>> {
        let transactions = self.transactions(trader).await?;
        profit_by_symbol(&transactions)
    }

    /// Snapshot valued at `current_prices`. Every held symbol must be priced.
    pub async fn performance_stats(
        &self,
        trader: TraderId,
        current_prices: &BTreeMap<String, Decimal>,
    ) -> LedgerResult<PerformanceStats> {
        let account = self.trader(trader).await?;
        let transactions = self.transactions(trader).await?;
        let holdings = net_holdings(&transactions);

        let mut holdings_value = BTreeMap::new();
        for (symbol, quantity) in &holdings {
            let price = current_prices
                .get(symbol)
                .ok_or_else(|| LedgerError::UnknownAsset(symbol.clone()))?;
            let value = quantity
                .checked_mul(*price)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            holdings_value.insert(symbol.clone(), value);
        }
        let portfolio_value = checked_sum(holdings_value.values().copied())?;
        let total_equity = account
            .balance
            .checked_add(portfolio_value)
            .ok_or(LedgerError::ArithmeticOverflow)?;

        Ok(PerformanceStats {
            trader: account.name,
            balance: account.balance,
            initial_balance: account.initial_balance,
            realized_profit: realized(&transactions)?,
            portfolio_value,
            total_equity,
            holdings,
            holdings_value,
            realized_profit_by_symbol: profit_by_symbol(&transactions)?,
        })
    }

    // ---- thoughts ----

    /// Append a decision record. Only fails if the trader is unknown or the
    /// store is unavailable.
    pub async fn record_thought(&self, trader: TraderId, thought: NewThought) -> LedgerResult<Thought> {
        let confidence = if thought.confidence.is_finite() {
            thought.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if confidence != thought.confidence {
            warn!("Clamped thought confidence {} to {}", thought.confidence, confidence);
        }

        let _guard = self.write_lock.lock().await;
        // surface a missing trader as such rather than as a constraint failure
        self.trader(trader).await?;

        let timestamp = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO thoughts (trader_id, mode, action, symbol, quantity, confidence,
                                  reasoning, outcome, detail, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trader)
        .bind(thought.mode.as_str())
        .bind(thought.action.as_str())
        .bind(&thought.symbol)
        .bind(thought.quantity.to_string())
        .bind(confidence)
        .bind(&thought.reasoning)
        .bind(thought.outcome.as_str())
        .bind(&thought.detail)
        .bind(timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            "Thought for trader {}: {} {} x{} -> {}",
            trader, thought.action, thought.symbol, thought.quantity, thought.outcome
        );

        Ok(Thought {
            id: result.last_insert_rowid(),
            trader_id: trader,
            mode: thought.mode,
            action: thought.action,
            symbol: thought.symbol,
            quantity: thought.quantity,
            confidence,
            reasoning: thought.reasoning,
            outcome: thought.outcome,
            detail: thought.detail,
            timestamp,
        })
    }

    /// Most recent thoughts first.
    pub async fn thoughts(&self, trader: TraderId, limit: u32) -> LedgerResult<Vec<Thought>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trader_id, mode, action, symbol, quantity, confidence,
                   reasoning, outcome, detail, timestamp
            FROM thoughts
            WHERE trader_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(trader)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(thought_from_row).collect()
    }
}

fn validate_trade(quantity: Decimal, price: Decimal) -> LedgerResult<()> {
    if quantity <= Decimal::ZERO {
        return Err(LedgerError::InvalidQuantity(quantity));
    }
    if price.is_sign_negative() && !price.is_zero() {
        return Err(LedgerError::InvalidPrice(price));
    }
    Ok(())
}

async fn balance_in(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    trader: TraderId,
) -> LedgerResult<Decimal> {
    let row = sqlx::query("SELECT balance FROM traders WHERE id = ?")
        .bind(trader)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::UnknownTrader(trader.to_string()))?;
    decimal(&row, "balance")
}

async fn holding_in(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    trader: TraderId,
    symbol: &str,
) -> LedgerResult<Decimal> {
    let rows = sqlx::query("SELECT quantity, kind FROM transactions WHERE trader_id = ? AND symbol = ?")
        .bind(trader)
        .bind(symbol)
        .fetch_all(&mut **tx)
        .await?;

    let mut held = Decimal::ZERO;
    for row in &rows {
        let quantity = decimal(row, "quantity")?;
        match kind(row)? {
            TransactionKind::Buy => held += quantity,
            TransactionKind::Sell => held -= quantity,
        }
    }
    Ok(held)
}

async fn append_trade(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    trader: TraderId,
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
    kind: TransactionKind,
    new_balance: Decimal,
) -> LedgerResult<Transaction> {
    sqlx::query("UPDATE traders SET balance = ? WHERE id = ?")
        .bind(new_balance.to_string())
        .bind(trader)
        .execute(&mut **tx)
        .await?;

    let timestamp = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (trader_id, symbol, quantity, price, kind, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(trader)
    .bind(symbol)
    .bind(quantity.to_string())
    .bind(price.to_string())
    .bind(kind.as_str())
    .bind(timestamp.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(Transaction {
        id: result.last_insert_rowid(),
        trader_id: trader,
        symbol: symbol.to_string(),
        quantity,
        price,
        kind,
        timestamp,
    })
}

fn net_holdings(transactions: &[Transaction]) -> BTreeMap<String, Decimal> {
    let mut holdings: BTreeMap<String, Decimal> = BTreeMap::new();
    for t in transactions {
        let entry = holdings.entry(t.symbol.clone()).or_default();
        match t.kind {
            TransactionKind::Buy => *entry += t.quantity,
            TransactionKind::Sell => *entry -= t.quantity,
        }
    }
    holdings.retain(|_, quantity| *quantity > Decimal::ZERO);
    holdings
}

fn checked_sum(amounts: impl IntoIterator<Item = Decimal>) -> LedgerResult<Decimal> {
    amounts.into_iter().try_fold(Decimal::ZERO, |total, amount| {
        total.checked_add(amount).ok_or(LedgerError::ArithmeticOverflow)
    })
}

fn realized(transactions: &[Transaction]) -> LedgerResult<Decimal> {
    transactions
        .iter()
        .map(Transaction::cash_flow)
        .try_fold(Decimal::ZERO, |total, flow| {
            total.checked_add(flow?).ok_or(LedgerError::ArithmeticOverflow)
        })
}

fn profit_by_symbol(transactions: &[Transaction]) -> LedgerResult<BTreeMap<String, Decimal>> {
    let mut profit: BTreeMap<String, Decimal> = BTreeMap::new();
    for t in transactions {
        let entry = profit.entry(t.symbol.clone()).or_default();
        *entry = entry
            .checked_add(t.cash_flow()?)
            .ok_or(LedgerError::ArithmeticOverflow)?;
    }
    Ok(profit)
}

fn decimal(row: &SqliteRow, column: &str) -> LedgerResult<Decimal> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|e| LedgerError::Corrupt(format!("{} = {:?}: {}", column, raw, e)))
}

fn timestamp(row: &SqliteRow, column: &str) -> LedgerResult<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("{} = {:?}: {}", column, raw, e)))
}

fn parsed<T: FromStr<Err = anyhow::Error>>(row: &SqliteRow, column: &str) -> LedgerResult<T> {
    let raw: String = row.try_get(column)?;
    T::from_str(&raw).map_err(|e| LedgerError::Corrupt(format!("{} = {:?}: {}", column, raw, e)))
}

fn kind(row: &SqliteRow) -> LedgerResult<TransactionKind> {
    parsed(row, "kind")
}

fn trader_from_row(row: &SqliteRow) -> LedgerResult<Trader> {
    Ok(Trader {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        mode: parsed::<StrategyMode>(row, "mode")?,
        balance: decimal(row, "balance")?,
        initial_balance: decimal(row, "initial_balance")?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> LedgerResult<Transaction> {
    Ok(Transaction {
        id: row.try_get("id")?,
        trader_id: row.try_get("trader_id")?,
        symbol: row.try_get("symbol")?,
        quantity: decimal(row, "quantity")?,
        price: decimal(row, "price")?,
        kind: kind(row)?,
        timestamp: timestamp(row, "timestamp")?,
    })
}

fn thought_from_row(row: &SqliteRow) -> LedgerResult<Thought> {
    Ok(Thought {
        id: row.try_get("id")?,
        trader_id: row.try_get("trader_id")?,
        mode: parsed::<StrategyMode>(row, "mode")?,
        action: parsed::<TradeAction>(row, "action")?,
        symbol: row.try_get("symbol")?,
        quantity: decimal(row, "quantity")?,
        confidence: row.try_get("confidence")?,
        reasoning: row.try_get("reasoning")?,
        outcome: parsed::<ThoughtOutcome>(row, "outcome")?,
        detail: row.try_get("detail")?,
        timestamp: timestamp(row, "timestamp")?,
    })
}
