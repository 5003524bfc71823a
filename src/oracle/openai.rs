use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::plan::{parse_plan, Plan};
use super::request::DecisionRequest;
use super::{DecisionOracle, OracleError};
use crate::config::OracleSettings;

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Decision oracle backed by an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiOracle {
    client: Client,
    base_url: String,
    model: String,
    temperature: f64,
    api_key: String,
}

impl OpenAiOracle {
    pub fn new(settings: &OracleSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            api_key: settings.api_key.clone(),
        })
    }

    fn body<'a>(&'a self, request: &DecisionRequest) -> Result<ChatRequest<'a>, OracleError> {
        let user = request
            .user_prompt()
            .map_err(|e| OracleError::Unavailable(format!("could not render prompt: {}", e)))?;
        Ok(ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
        })
    }
}

/// First choice's text, or a malformed-reply error.
fn reply_text(response: ChatResponse) -> Result<String, OracleError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| OracleError::Unavailable("response carried no choices".to_string()))
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    async fn propose_plan(&self, request: &DecisionRequest) -> Result<Plan, OracleError> {
        if self.api_key.is_empty() {
            return Err(OracleError::Unavailable("no API key configured".to_string()));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = self.body(request)?;
        debug!("Requesting {} plan for {} from {}", request.mode, request.trader, self.model);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => OracleError::RateLimited,
                401 | 403 => OracleError::Unauthorized,
                _ => OracleError::Unavailable(format!("status {}: {}", status, text)),
            });
        }

        let response: ChatResponse = response.json().await?;
        let text = reply_text(response)?;
        let plan = parse_plan(&text)?;

        info!("Oracle proposed {} item(s) for {}", plan.len(), request.trader);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MarketContext;
    use crate::types::StrategyMode;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn request() -> DecisionRequest {
        DecisionRequest {
            trader: "Alice".to_string(),
            mode: StrategyMode::Defensive,
            instruction: "Protect capital.".to_string(),
            context: MarketContext {
                timestamp: Utc::now(),
                current_prices: BTreeMap::new(),
                forecasts: BTreeMap::new(),
                forecast_errors: BTreeMap::new(),
                sentiment: BTreeMap::new(),
                portfolio: None,
            },
        }
    }

    #[test]
    fn test_request_body_shape() {
        let oracle = OpenAiOracle::new(&OracleSettings::default()).unwrap();
        let body = serde_json::to_value(oracle.body(&request()).unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.4);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .starts_with("Protect capital."));
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn test_reply_text_extraction() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "[]"}}]}"#,
        )
        .unwrap();
        assert_eq!(reply_text(response).unwrap(), "[]");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(reply_text(empty), Err(OracleError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let oracle = OpenAiOracle::new(&OracleSettings::default()).unwrap();
        let err = oracle.propose_plan(&request()).await.unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }
}
