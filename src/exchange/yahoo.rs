use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::PriceFeed;
use crate::types::{Candle, PriceSeries};

const YAHOO_CHART_API: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) stock-decision-bot";
const PRICE_DECIMALS: u32 = 4;

/// Yahoo Finance chart API client.
#[derive(Debug, Clone)]
pub struct YahooFeed {
    client: Client,
    base_url: String,
    interval: String,
    range: String,
}

impl YahooFeed {
    pub fn new(interval: impl Into<String>, range: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: YAHOO_CHART_API.to_string(),
            interval: interval.into(),
            range: range.into(),
        })
    }

    async fn chart(&self, symbol: &str, interval: &str, range: &str) -> Result<ChartResult> {
        let url = format!(
            "{}/{}?interval={}&range={}",
            self.base_url, symbol, interval, range
        );
        debug!("GET {}", url);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("Yahoo chart request for {} failed: HTTP {}", symbol, status));
        }

        let body: ChartResponse = resp
            .json()
            .await
            .with_context(|| format!("Unexpected chart payload for {}", symbol))?;
        first_result(symbol, body)
    }
}

#[async_trait]
impl PriceFeed for YahooFeed {
    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        let result = self.chart(symbol, "1m", "1d").await?;
        if let Some(price) = result.meta.regular_market_price.and_then(Decimal::from_f64) {
            return Ok(price.round_dp(PRICE_DECIMALS));
        }
        let series = to_series(symbol, result)?;
        series
            .last()
            .map(|c| c.close)
            .ok_or_else(|| anyhow!("No price data for {}", symbol))
    }

    async fn history(&self, symbol: &str) -> Result<PriceSeries> {
        let result = self.chart(symbol, &self.interval, &self.range).await?;
        let series = to_series(symbol, result)?;
        info!("Fetched {} {} bars for {} ({})", series.len(), self.interval, symbol, self.range);
        Ok(series)
    }
}

fn first_result(symbol: &str, body: ChartResponse) -> Result<ChartResult> {
    if let Some(err) = body.chart.error {
        return Err(anyhow!(
            "Yahoo chart error for {}: {}",
            symbol,
            err.description.unwrap_or(err.code)
        ));
    }
    body.chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| anyhow!("Empty chart result for {}", symbol))
}

/// Zip the column arrays into bars, dropping any row with a missing field.
fn to_series(symbol: &str, result: ChartResult) -> Result<PriceSeries> {
    let timestamps = result.timestamp.unwrap_or_default();
    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .unwrap_or_default();

    let mut series = PriceSeries::new(symbol);
    for (i, ts) in timestamps.iter().enumerate() {
        let field = |col: &Vec<Option<f64>>| {
            col.get(i)
                .copied()
                .flatten()
                .and_then(Decimal::from_f64)
                .map(|d| d.round_dp(PRICE_DECIMALS))
        };
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            field(&quote.open),
            field(&quote.high),
            field(&quote.low),
            field(&quote.close),
            field(&quote.volume),
        ) else {
            continue;
        };
        let Some(timestamp) = Utc.timestamp_opt(*ts, 0).single() else {
            continue;
        };

        series.push(Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    Ok(series)
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}
