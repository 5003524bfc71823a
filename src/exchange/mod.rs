pub mod yahoo;

pub use yahoo::YahooFeed;

use async_trait::async_trait;
use rust_decimal::Decimal;
use crate::types::PriceSeries;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn current_price(&self, symbol: &str) -> anyhow::Result<Decimal>;
    async fn history(&self, symbol: &str) -> anyhow::Result<PriceSeries>;
}
