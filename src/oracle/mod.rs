pub mod openai;
pub mod plan;
pub mod request;

pub use openai::OpenAiOracle;
pub use plan::{MalformedPlanError, Plan, PlanItem};
pub use request::{DecisionRequest, MarketContext};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle rate limit exceeded")]
    RateLimited,

    #[error("oracle rejected the API key")]
    Unauthorized,

    #[error("oracle reply malformed: {0}")]
    Malformed(#[from] MalformedPlanError),
}

impl From<reqwest::Error> for OracleError {
    fn from(e: reqwest::Error) -> Self {
        OracleError::Unavailable(e.to_string())
    }
}

/// External decision maker turning a market context into a trade plan.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn propose_plan(&self, request: &DecisionRequest) -> Result<Plan, OracleError>;
}
