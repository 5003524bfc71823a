use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{ExecutionReport, LoopController, LoopStatus, PlanExecutor};
use crate::config::{AppConfig, ModeTable};
use crate::exchange::PriceFeed;
use crate::ledger::{PortfolioLedger, Trader};
use crate::ml::{Forecast, ForecastError, Predictor};
use crate::oracle::{DecisionOracle, DecisionRequest, MarketContext, Plan};
use crate::sentiment::{collect_sentiment, SentimentSource};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub symbols: Vec<String>,
    pub horizon: usize,
    pub min_confidence: f64,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            symbols: config.general.symbols.clone(),
            horizon: config.forecast.horizon,
            min_confidence: config.decision.min_confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraderReport {
    pub trader: String,
    /// Set when the oracle failed and the hold-everything plan was used.
    pub fallback: Option<String>,
    pub execution: ExecutionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick_id: Uuid,
    pub priced: usize,
    pub forecast_errors: BTreeMap<String, String>,
    pub traders: Vec<TraderReport>,
}

/// The periodic orchestrator: collect context, ask the oracle for a plan per
/// trader, then validate, apply and record each item.
pub struct DecisionLoop {
    settings: LoopSettings,
    predictor: Arc<Predictor>,
    feed: Arc<dyn PriceFeed>,
    ledger: Arc<PortfolioLedger>,
    oracle: Arc<dyn DecisionOracle>,
    sentiment: Vec<Arc<dyn SentimentSource>>,
    modes: ModeTable,
    executor: PlanExecutor,
    controller: Arc<LoopController>,
}

impl DecisionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: LoopSettings,
        predictor: Arc<Predictor>,
        feed: Arc<dyn PriceFeed>,
        ledger: Arc<PortfolioLedger>,
        oracle: Arc<dyn DecisionOracle>,
        sentiment: Vec<Arc<dyn SentimentSource>>,
        modes: ModeTable,
        controller: Arc<LoopController>,
    ) -> Self {
        let executor = PlanExecutor::new(ledger.clone(), controller.clone(), settings.min_confidence);
        Self {
            settings,
            predictor,
            feed,
            ledger,
            oracle,
            sentiment,
            modes,
            executor,
            controller,
        }
    }

    pub fn controller(&self) -> &Arc<LoopController> {
        &self.controller
    }

    /// Tick every `interval` until the controller is stopped. A failed tick
    /// is logged and the loop keeps going.
    pub async fn run(&self, interval: Duration) -> Result<()> {
        if !self.controller.is_running() {
            self.controller.start().await.map_err(anyhow::Error::msg)?;
        }
        let mut status_rx = self.controller.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Decision loop running every {:?} over {} symbol(s)",
            interval,
            self.settings.symbols.len()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.controller.is_running() {
                        break;
                    }
                    if let Err(e) = self.tick().await {
                        error!("Tick aborted: {:#}", e);
                    }
                }
                status = status_rx.recv() => {
                    match status {
                        Ok(LoopStatus::Stopped) | Err(RecvError::Closed) => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                    }
                }
            }
        }

        let state = self.controller.get_state().await;
        info!(
            "Decision loop stopped after {} tick(s) and {} trade(s)",
            state.ticks, state.trades
        );
        Ok(())
    }

    /// One full cycle. Only storage failures make this return an error.
    pub async fn tick(&self) -> Result<TickReport> {
        let tick_id = Uuid::new_v4();
        let span = info_span!("tick", %tick_id);
        self.run_tick(tick_id).instrument(span).await
    }

    async fn run_tick(&self, tick_id: Uuid) -> Result<TickReport> {
        let tick = self.controller.record_tick().await;
        info!("Starting tick #{}", tick);

        let context = self.collect_context().await;
        let traders = self.ledger.list_traders().await?;
        if traders.is_empty() {
            warn!("No traders in the ledger; nothing to decide");
        }

        let mut reports = Vec::with_capacity(traders.len());
        for trader in &traders {
            if !self.controller.should_continue() {
                warn!("Loop stopped, skipping remaining traders");
                break;
            }
            let span = info_span!("trader", name = %trader.name, mode = %trader.mode);
            let report = self.run_trader(trader, &context).instrument(span).await?;
            reports.push(report);
        }

        info!(
            "Tick #{} done: {} priced, {} forecast error(s), {} trader(s)",
            tick,
            context.current_prices.len(),
            context.forecast_errors.len(),
            reports.len()
        );

        Ok(TickReport {
            tick_id,
            priced: context.current_prices.len(),
            forecast_errors: context.forecast_errors,
            traders: reports,
        })
    }

    /// Shared market context for every trader this tick. Nothing in here
    /// aborts the tick; gaps are logged and left out.
    async fn collect_context(&self) -> MarketContext {
        for symbol in &self.settings.symbols {
            match self.predictor.train(symbol, false).await {
                Ok(trained) if !trained.is_empty() => {
                    debug!("Refreshed {} model(s) for {}", trained.len(), symbol)
                }
                Ok(_) => {}
                Err(e) => warn!("Could not refresh models for {}: {}", symbol, e),
            }
        }

        let mut current_prices = BTreeMap::new();
        for symbol in &self.settings.symbols {
            match self.feed.current_price(symbol).await {
                Ok(price) if price > Decimal::ZERO => {
                    current_prices.insert(symbol.clone(), price);
                }
                Ok(price) => warn!("Ignoring non-positive price {} for {}", price, symbol),
                Err(e) => warn!("No current price for {}: {:#}", symbol, e),
            }
        }

        let mut forecasts = BTreeMap::new();
        let mut forecast_errors = BTreeMap::new();
        for symbol in &self.settings.symbols {
            match self.forecast(symbol).await {
                Ok(forecast) => {
                    forecasts.insert(symbol.clone(), forecast);
                }
                Err(e) => {
                    warn!("Forecast for {} unavailable: {}", symbol, e);
                    forecast_errors.insert(symbol.clone(), e.to_string());
                }
            }
        }

        let sentiment = collect_sentiment(&self.sentiment, &self.settings.symbols).await;

        MarketContext {
            timestamp: Utc::now(),
            current_prices,
            forecasts,
            forecast_errors,
            sentiment,
            portfolio: None,
        }
    }

    /// Forecast, training once more if an artifact turned out to be missing.
    async fn forecast(&self, symbol: &str) -> Result<Forecast, ForecastError> {
        match self.predictor.forecast(symbol, self.settings.horizon).await {
            Err(ForecastError::ModelNotReady { kind, .. }) => {
                debug!("{} model for {} not ready, retraining", kind, symbol);
                self.predictor.train(symbol, true).await?;
                self.predictor.forecast(symbol, self.settings.horizon).await
            }
            other => other,
        }
    }

    async fn run_trader(&self, trader: &Trader, shared: &MarketContext) -> Result<TraderReport> {
        let portfolio = match self
            .ledger
            .performance_stats(trader.id, &shared.current_prices)
            .await
        {
            Ok(stats) => Some(stats),
            Err(e) if e.is_storage() => return Err(e.into()),
            Err(e) => {
                warn!("Could not value {}'s portfolio: {}", trader.name, e);
                None
            }
        };

        let request = DecisionRequest {
            trader: trader.name.clone(),
            mode: trader.mode,
            instruction: self.modes.instruction(trader.mode).to_string(),
            context: MarketContext {
                portfolio,
                ..shared.clone()
            },
        };

        let (plan, fallback) = match self.oracle.propose_plan(&request).await {
            Ok(plan) => (plan, None),
            Err(e) => {
                warn!("Oracle failed for {}, holding every symbol: {}", trader.name, e);
                let reason = format!("oracle fallback: {}", e);
                (Plan::hold_all(&self.settings.symbols, &reason), Some(e.to_string()))
            }
        };

        let execution = self
            .executor
            .execute(trader, &plan, &shared.current_prices)
            .await?;
        info!(
            "{}: {} thought(s) recorded ({} executed, {} held, {} rejected, {} failed)",
            trader.name,
            execution.recorded(),
            execution.executed,
            execution.held,
            execution.rejected,
            execution.failed
        );

        Ok(TraderReport {
            trader: trader.name.clone(),
            fallback,
            execution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockPriceFeed;
    use crate::ledger::ThoughtOutcome;
    use crate::ml::cache::test_support::ManualClock;
    use crate::ml::{ForecastCache, LinearTrainer, PredictorSettings};
    use crate::oracle::{MalformedPlanError, MockDecisionOracle, OracleError, PlanItem};
    use crate::sentiment::MockSentimentSource;
    use crate::types::{Candle, PriceSeries, StrategyMode, TradeAction};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn series(symbol: &str, len: usize) -> PriceSeries {
        let start = chrono::DateTime::<Utc>::UNIX_EPOCH;
        let candles = (0..len)
            .map(|i| {
                let close = Decimal::from(40 + (i % 7) as i64);
                Candle {
                    timestamp: start + chrono::Duration::hours(i as i64),
                    open: close,
                    high: close + Decimal::ONE,
                    low: close - Decimal::ONE,
                    close,
                    volume: Decimal::from(500 + i as i64),
                }
            })
            .collect();
        PriceSeries::from_candles(symbol, candles)
    }

    fn feed() -> Arc<MockPriceFeed> {
        let mut feed = MockPriceFeed::new();
        feed.expect_history()
            .returning(|symbol| Ok(series(symbol, 40)));
        feed.expect_current_price().returning(|symbol| match symbol {
            "X" => Ok(dec!(50)),
            "Y" => Ok(dec!(20)),
            other => Err(anyhow::anyhow!("unknown symbol {}", other)),
        });
        Arc::new(feed)
    }

    struct Fixture {
        decision_loop: DecisionLoop,
        ledger: Arc<PortfolioLedger>,
        trader: Trader,
        dir: tempfile::TempDir,
    }

    async fn fixture(oracle: MockDecisionOracle, sentiment: Vec<Arc<dyn SentimentSource>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let feed = feed();
        let predictor = Arc::new(Predictor::new(
            PredictorSettings::default(),
            feed.clone(),
            Arc::new(LinearTrainer::new()),
            ForecastCache::new(dir.path(), Arc::new(ManualClock::new(Utc::now()))),
        ));
        let ledger = Arc::new(PortfolioLedger::in_memory().await.unwrap());
        let trader = ledger
            .create_trader("Alice", StrategyMode::Momentum, dec!(10000))
            .await
            .unwrap();

        let decision_loop = DecisionLoop::new(
            LoopSettings {
                symbols: vec!["X".to_string(), "Y".to_string()],
                horizon: 3,
                min_confidence: 0.6,
            },
            predictor,
            feed,
            ledger.clone(),
            Arc::new(oracle),
            sentiment,
            ModeTable::builtin(),
            Arc::new(LoopController::new_running()),
        );

        Fixture {
            decision_loop,
            ledger,
            trader,
            dir,
        }
    }

    fn buy(symbol: &str, quantity: Decimal, confidence: f64) -> PlanItem {
        PlanItem {
            action: TradeAction::Buy,
            symbol: symbol.to_string(),
            quantity,
            confidence,
            reasoning: "forecast trending up".to_string(),
        }
    }

    #[tokio::test]
    async fn test_low_confidence_plan_is_rejected() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_propose_plan()
            .times(1)
            .returning(|_| Ok(Plan::new(vec![buy("X", dec!(5), 0.4)])));
        let f = fixture(oracle, Vec::new()).await;

        let report = f.decision_loop.tick().await.unwrap();
        assert_eq!(report.traders.len(), 1);
        assert_eq!(report.traders[0].execution.rejected, 1);

        let trader = f.ledger.trader(f.trader.id).await.unwrap();
        assert_eq!(trader.balance, dec!(10000));
        assert!(f.ledger.transactions(f.trader.id).await.unwrap().is_empty());

        let thoughts = f.ledger.thoughts(f.trader.id, 10).await.unwrap();
        assert_eq!(thoughts.len(), 1);
        assert_eq!(thoughts[0].outcome, ThoughtOutcome::Rejected);
        assert_eq!(thoughts[0].mode, StrategyMode::Momentum);
    }

    #[tokio::test]
    async fn test_malformed_reply_holds_every_symbol() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_propose_plan()
            .returning(|_| Err(OracleError::Malformed(MalformedPlanError::NoJson)));
        let f = fixture(oracle, Vec::new()).await;

        let report = f.decision_loop.tick().await.unwrap();
        assert!(report.traders[0].fallback.is_some());

        assert!(f.ledger.transactions(f.trader.id).await.unwrap().is_empty());
        let thoughts = f.ledger.thoughts(f.trader.id, 10).await.unwrap();
        let mut symbols: Vec<_> = thoughts.iter().map(|t| t.symbol.clone()).collect();
        symbols.sort();
        assert_eq!(symbols, vec!["X", "Y"]);
        assert!(thoughts
            .iter()
            .all(|t| t.action == TradeAction::Hold && t.outcome == ThoughtOutcome::Held));
    }

    #[tokio::test]
    async fn test_unavailable_oracle_holds_every_symbol() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_propose_plan()
            .times(1)
            .returning(|_| Err(OracleError::Unavailable("connection refused".to_string())));
        let f = fixture(oracle, Vec::new()).await;

        let report = f.decision_loop.tick().await.unwrap();
        let trader = &report.traders[0];
        assert_eq!(trader.fallback.as_deref(), Some("oracle unavailable: connection refused"));
        assert_eq!(trader.execution.held, 2);
        assert_eq!(trader.execution.recorded(), 2);

        assert_eq!(f.ledger.trader(f.trader.id).await.unwrap().balance, dec!(10000));
        assert!(f.ledger.transactions(f.trader.id).await.unwrap().is_empty());
        let thoughts = f.ledger.thoughts(f.trader.id, 10).await.unwrap();
        assert_eq!(thoughts.len(), 2);
        assert!(thoughts.iter().all(|t| t.action == TradeAction::Hold
            && t.outcome == ThoughtOutcome::Held
            && t.reasoning.contains("oracle unavailable")));
    }

    #[tokio::test]
    async fn test_missing_artifacts_are_retrained_before_forecasting() {
        let f = fixture(MockDecisionOracle::new(), Vec::new()).await;

        // Another predictor fills the shared models directory, then the
        // artifacts vanish while the freshness records stay behind.
        let other = Predictor::new(
            PredictorSettings::default(),
            feed(),
            Arc::new(LinearTrainer::new()),
            ForecastCache::new(f.dir.path(), Arc::new(ManualClock::new(Utc::now()))),
        );
        assert!(!other.train("X", false).await.unwrap().is_empty());

        let asset_dir = f.dir.path().join("X");
        for entry in std::fs::read_dir(&asset_dir).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().map_or(false, |name| name != "freshness.json") {
                std::fs::remove_file(&path).unwrap();
            }
        }
        assert_eq!(std::fs::read_dir(&asset_dir).unwrap().count(), 1);

        let forecast = f.decision_loop.forecast("X").await.unwrap();
        assert_eq!(forecast.len(), PredictorSettings::default().kinds.len());
        assert!(forecast.values().all(|v| v.len() == 3));
        assert!(std::fs::read_dir(&asset_dir).unwrap().count() > 1);
    }

    #[tokio::test]
    async fn test_accepted_buy_is_applied_and_context_is_complete() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_propose_plan()
            .withf(|request| {
                let ctx = &request.context;
                request.mode == StrategyMode::Momentum
                    && ctx.current_prices.len() == 2
                    && ctx.forecasts.get("X").map_or(false, |f| f.values().all(|v| v.len() == 3))
                    && ctx.sentiment.contains_key("reddit")
                    && ctx.portfolio.as_ref().map_or(false, |p| p.balance == dec!(10000))
            })
            .returning(|_| Ok(Plan::new(vec![buy("X", dec!(10), 0.8)])));

        let mut reddit = MockSentimentSource::new();
        reddit.expect_name().returning(|| "reddit".to_string());
        reddit
            .expect_snapshot()
            .returning(|_| Ok(BTreeMap::from([("X".to_string(), json!({"mentions": 12}))])));
        let mut news = MockSentimentSource::new();
        news.expect_name().returning(|| "news".to_string());
        news.expect_snapshot()
            .returning(|_| Err(anyhow::anyhow!("feed down")));

        let f = fixture(oracle, vec![Arc::new(reddit), Arc::new(news)]).await;
        let report = f.decision_loop.tick().await.unwrap();

        assert!(report.forecast_errors.is_empty());
        assert_eq!(report.priced, 2);
        assert_eq!(report.traders[0].execution.executed, 1);
        assert_eq!(f.ledger.trader(f.trader.id).await.unwrap().balance, dec!(9500));
        assert_eq!(f.ledger.holdings(f.trader.id).await.unwrap()["X"], dec!(10));
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_the_tick() {
        let f = fixture(MockDecisionOracle::new(), Vec::new()).await;
        f.ledger.close().await;

        assert!(f.decision_loop.tick().await.is_err());
        assert_eq!(f.decision_loop.controller().get_state().await.ticks, 1);
    }

    #[tokio::test]
    async fn test_run_returns_once_stopped() {
        let mut oracle = MockDecisionOracle::new();
        oracle.expect_propose_plan().returning(|_| Ok(Plan::default()));
        let f = fixture(oracle, Vec::new()).await;

        let controller = f.decision_loop.controller().clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            controller.stop().unwrap();
        });

        tokio::time::timeout(Duration::from_secs(10), f.decision_loop.run(Duration::from_secs(3600)))
            .await
            .expect("loop did not stop")
            .unwrap();
        stopper.await.unwrap();
        assert!(f.decision_loop.controller().get_state().await.ticks >= 1);
    }
}
