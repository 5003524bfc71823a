mod config;
mod engine;
mod exchange;
mod ledger;
mod ml;
mod oracle;
mod sentiment;
mod types;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{AppConfig, ModeTable};
use engine::{DecisionLoop, LoopController, LoopSettings};
use exchange::{PriceFeed, YahooFeed};
use ledger::PortfolioLedger;
use ml::{ForecastCache, LinearTrainer, Predictor, PredictorSettings, SystemClock};
use oracle::OpenAiOracle;
use sentiment::{FileSentimentSource, SentimentSource};
use types::StrategyMode;

#[derive(Parser)]
#[command(name = "stock-decision-bot")]
#[command(version = "0.1.0")]
#[command(about = "Periodic forecast-driven stock trading decisions on a paper ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the decision loop every configured interval until Ctrl-C
    Run,
    /// Run a single decision cycle and exit
    Tick,
    /// Train forecast models for every configured symbol
    Train {
        /// Retrain even when the models are still fresh
        #[arg(short, long)]
        force: bool,
    },
    /// Print forecasts for one or all configured symbols
    Forecast {
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Show performance of one or all traders
    Status {
        #[arg(short, long)]
        trader: Option<String>,
    },
    /// Show a trader's realized profit, in total and per symbol
    Pnl {
        #[arg(short, long)]
        trader: String,
    },
    /// Show a trader's most recent decisions
    Thoughts {
        #[arg(short, long)]
        trader: String,
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Create a trader in the ledger
    InitTrader {
        #[arg(short, long)]
        name: String,
        /// value, growth, momentum, defensive or balanced
        #[arg(short, long, default_value = "balanced")]
        mode: String,
        /// Opening cash balance
        #[arg(short, long, default_value = "100000")]
        balance: String,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv() {
        // a missing .env is normal
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {}", e);
        }
    }

    init_logging(cli.verbose, cli.json_logs)?;

    let config = AppConfig::load(Some(Path::new(&cli.config)))?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config error: {}", e);
        }
        return Err(anyhow!("Invalid configuration ({} error(s))", errors.len()));
    }

    info!("Stock Decision Bot v0.1.0");

    match cli.command {
        Commands::Run => run_loop(&config).await?,
        Commands::Tick => run_single_tick(&config).await?,
        Commands::Train { force } => train_models(&config, force).await?,
        Commands::Forecast { symbol } => show_forecasts(&config, symbol).await?,
        Commands::Status { trader } => show_status(&config, trader).await?,
        Commands::Pnl { trader } => show_pnl(&config, &trader).await?,
        Commands::Thoughts { trader, limit } => show_thoughts(&config, &trader, limit).await?,
        Commands::InitTrader { name, mode, balance } => init_trader(&config, &name, &mode, &balance).await?,
        Commands::ShowConfig => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn price_feed(config: &AppConfig) -> Result<Arc<dyn PriceFeed>> {
    let feed = YahooFeed::new(
        config.forecast.history_interval.clone(),
        config.forecast.history_range.clone(),
    )?;
    Ok(Arc::new(feed))
}

fn predictor(config: &AppConfig, feed: Arc<dyn PriceFeed>) -> Arc<Predictor> {
    let settings = PredictorSettings {
        window_size: config.forecast.window_size,
        ttl: chrono::Duration::minutes(config.forecast.ttl_minutes),
        kinds: config.forecast.model_kinds.clone(),
    };
    let cache = ForecastCache::new(&config.general.models_dir, Arc::new(SystemClock));
    Arc::new(Predictor::new(settings, feed, Arc::new(LinearTrainer::new()), cache))
}

async fn sentiment_sources(config: &AppConfig) -> Vec<Arc<dyn SentimentSource>> {
    let Some(path) = &config.general.sentiment_file else {
        return Vec::new();
    };
    match FileSentimentSource::discover(path).await {
        Ok(sources) => {
            info!("Loaded {} sentiment source(s) from {}", sources.len(), path);
            sources
                .into_iter()
                .map(|s| Arc::new(s) as Arc<dyn SentimentSource>)
                .collect()
        }
        Err(e) => {
            warn!("Sentiment disabled: {:#}", e);
            Vec::new()
        }
    }
}

/// Create any configured trader the ledger does not know yet.
async fn ensure_traders(config: &AppConfig, ledger: &PortfolioLedger) -> Result<()> {
    for settings in &config.traders {
        if ledger.find_trader(&settings.name).await?.is_none() {
            ledger
                .create_trader(&settings.name, settings.mode, settings.initial_balance)
                .await?;
        }
    }
    Ok(())
}

async fn build_loop(config: &AppConfig) -> Result<DecisionLoop> {
    let ledger = Arc::new(PortfolioLedger::open(&config.general.database_url).await?);
    ensure_traders(config, &ledger).await?;

    if config.oracle.api_key.is_empty() {
        warn!("No OpenAI API key configured; every plan will fall back to HOLD");
    }

    let feed = price_feed(config)?;
    let predictor = predictor(config, feed.clone());
    let oracle = Arc::new(OpenAiOracle::new(&config.oracle)?);
    let controller = Arc::new(LoopController::new());

    Ok(DecisionLoop::new(
        LoopSettings::from_config(config),
        predictor,
        feed,
        ledger,
        oracle,
        sentiment_sources(config).await,
        ModeTable::with_overrides(&config.modes),
        controller,
    ))
}

async fn run_loop(config: &AppConfig) -> Result<()> {
    let decision_loop = build_loop(config).await?;
    let controller = decision_loop.controller().clone();
    controller.start().await.map_err(anyhow::Error::msg)?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            let _ = controller.stop();
        }
    });

    let interval = Duration::from_secs(config.general.interval_minutes * 60);
    decision_loop.run(interval).await
}

async fn run_single_tick(config: &AppConfig) -> Result<()> {
    let decision_loop = build_loop(config).await?;
    decision_loop
        .controller()
        .start()
        .await
        .map_err(anyhow::Error::msg)?;

    let report = decision_loop.tick().await?;

    println!("\n=== Tick {} ===", report.tick_id);
    println!("Priced symbols: {}", report.priced);
    for (symbol, reason) in &report.forecast_errors {
        println!("Forecast unavailable for {}: {}", symbol, reason);
    }
    for trader in &report.traders {
        let e = &trader.execution;
        println!(
            "{}: {} executed, {} held, {} rejected, {} failed",
            trader.trader, e.executed, e.held, e.rejected, e.failed
        );
        if let Some(reason) = &trader.fallback {
            println!("  (oracle fallback: {})", reason);
        }
    }

    let state = decision_loop.controller().get_state().await;
    println!("Trades executed this run: {}", state.trades);
    Ok(())
}

async fn train_models(config: &AppConfig, force: bool) -> Result<()> {
    let predictor = predictor(config, price_feed(config)?);

    for symbol in &config.general.symbols {
        match predictor.train(symbol, force).await {
            Ok(trained) if trained.is_empty() => println!("{}: all models fresh", symbol),
            Ok(trained) => {
                let names: Vec<_> = trained.iter().map(|k| k.as_str()).collect();
                println!("{}: trained {}", symbol, names.join(", "));
            }
            Err(e) => error!("Training failed for {}: {}", symbol, e),
        }
        for (kind, freshness, trained_at) in predictor.freshness(symbol) {
            let at = trained_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!("  {:<18} {:?} (trained {})", kind.as_str(), freshness, at);
        }
    }
    Ok(())
}

async fn show_forecasts(config: &AppConfig, symbol: Option<String>) -> Result<()> {
    let symbols = match symbol {
        Some(s) => vec![s.trim().to_uppercase()],
        None => config.general.symbols.clone(),
    };
    let predictor = predictor(config, price_feed(config)?);

    println!("\n=== Forecasts ({} steps) ===", config.forecast.horizon);

    for symbol in symbols {
        if let Err(e) = predictor.train(&symbol, false).await {
            error!("Training failed for {}: {}", symbol, e);
            continue;
        }
        match predictor.forecast(&symbol, config.forecast.horizon).await {
            Ok(forecast) => {
                println!("\n--- {} ---", symbol);
                for (kind, values) in forecast {
                    let formatted: Vec<_> = values.iter().map(|v| format!("{:.2}", v)).collect();
                    println!("{:<18} {}", kind.as_str(), formatted.join(" "));
                }
            }
            Err(e) => error!("Forecast failed for {}: {}", symbol, e),
        }
    }
    Ok(())
}

async fn show_status(config: &AppConfig, name: Option<String>) -> Result<()> {
    let ledger = PortfolioLedger::open(&config.general.database_url).await?;
    let traders = match name {
        Some(name) => vec![ledger
            .find_trader(&name)
            .await?
            .ok_or_else(|| anyhow!("Unknown trader: {}", name))?],
        None => ledger.list_traders().await?,
    };
    if traders.is_empty() {
        println!("No traders yet. Create one with `init-trader` or run a tick.");
        return Ok(());
    }

    let feed = price_feed(config)?;
    for trader in traders {
        let mut prices = BTreeMap::new();
        for symbol in ledger.holdings(trader.id).await?.keys() {
            let price = feed
                .current_price(symbol)
                .await
                .with_context(|| format!("No current price for {}", symbol))?;
            prices.insert(symbol.clone(), price);
        }

        let stats = ledger.performance_stats(trader.id, &prices).await?;
        println!("\n{} mode", trader.mode);
        println!("{}", stats);
    }
    Ok(())
}

async fn show_pnl(config: &AppConfig, name: &str) -> Result<()> {
    let ledger = PortfolioLedger::open(&config.general.database_url).await?;
    let trader = ledger
        .find_trader(name)
        .await?
        .ok_or_else(|| anyhow!("Unknown trader: {}", name))?;

    println!("\n=== Realized P&L of {} ===", trader.name);
    for (symbol, profit) in ledger.realized_profit_by_symbol(trader.id).await? {
        println!("  {:<8} ${:.2}", symbol, profit);
    }
    println!("Total:     ${:.2}", ledger.realized_profit(trader.id).await?);
    Ok(())
}

async fn show_thoughts(config: &AppConfig, name: &str, limit: u32) -> Result<()> {
    let ledger = PortfolioLedger::open(&config.general.database_url).await?;
    let trader = ledger
        .find_trader(name)
        .await?
        .ok_or_else(|| anyhow!("Unknown trader: {}", name))?;

    println!("\n=== Recent decisions of {} ===", trader.name);
    for thought in ledger.thoughts(trader.id, limit).await? {
        println!(
            "[{}] {:<8} {:<4} {} {} (confidence {:.2})",
            thought.timestamp.format("%Y-%m-%d %H:%M"),
            thought.outcome,
            thought.action,
            thought.quantity,
            thought.symbol,
            thought.confidence
        );
        if !thought.reasoning.is_empty() {
            println!("    why: {}", thought.reasoning);
        }
        println!("    result: {}", thought.detail);
    }
    Ok(())
}

async fn init_trader(config: &AppConfig, name: &str, mode: &str, balance: &str) -> Result<()> {
    let mode = StrategyMode::from_str(mode)?;
    let balance = Decimal::from_str(balance).with_context(|| format!("Invalid balance: {}", balance))?;

    let ledger = PortfolioLedger::open(&config.general.database_url).await?;
    let trader = ledger.create_trader(name, mode, balance).await?;
    println!(
        "Created trader {} (id {}) in {} mode with ${:.2}",
        trader.name, trader.id, trader.mode, trader.balance
    );
    Ok(())
}
