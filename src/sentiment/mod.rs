use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Metrics per symbol as reported by one source.
pub type SentimentSnapshot = BTreeMap<String, Value>;

/// Snapshots keyed by source name, merged verbatim into the market context.
pub type SentimentReport = BTreeMap<String, SentimentSnapshot>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SentimentSource: Send + Sync {
    fn name(&self) -> String;
    async fn snapshot(&self, symbols: &[String]) -> Result<SentimentSnapshot>;
}

/// One named section of a JSON snapshot file shaped
/// `{"reddit": {"AAPL": {...}}, "news": {...}}`.
///
/// The file is re-read on every snapshot so an external scraper can refresh it
/// between ticks.
#[derive(Debug, Clone)]
pub struct FileSentimentSource {
    name: String,
    path: PathBuf,
}

impl FileSentimentSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// One source per top-level section currently in the file.
    pub async fn discover(path: impl Into<PathBuf>) -> Result<Vec<Self>> {
        let path = path.into();
        let sections = read_sections(&path).await?;
        Ok(sections
            .keys()
            .map(|name| Self::new(name.clone(), path.clone()))
            .collect())
    }
}

async fn read_sections(path: &Path) -> Result<BTreeMap<String, Value>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read sentiment file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Sentiment file {} is not a JSON object", path.display()))
}

#[async_trait]
impl SentimentSource for FileSentimentSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn snapshot(&self, symbols: &[String]) -> Result<SentimentSnapshot> {
        let mut sections = read_sections(&self.path).await?;
        let section = sections
            .remove(&self.name)
            .ok_or_else(|| anyhow!("Section {} missing from {}", self.name, self.path.display()))?;
        let Value::Object(per_symbol) = section else {
            return Err(anyhow!("Section {} is not an object", self.name));
        };

        Ok(per_symbol
            .into_iter()
            .filter(|(symbol, _)| symbols.iter().any(|s| s == symbol))
            .collect())
    }
}

/// Ask every source for a snapshot. A failing source is logged and left out.
pub async fn collect_sentiment(
    sources: &[Arc<dyn SentimentSource>],
    symbols: &[String],
) -> SentimentReport {
    let mut report = SentimentReport::new();
    for source in sources {
        let name = source.name();
        match source.snapshot(symbols).await {
            Ok(snapshot) => {
                debug!("Sentiment from {}: {} symbol(s)", name, snapshot.len());
                report.insert(name, snapshot);
            }
            Err(e) => warn!("Sentiment source {} failed, omitting it: {:#}", name, e),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn symbols() -> Vec<String> {
        vec!["AAPL".to_string(), "MSFT".to_string()]
    }

    #[tokio::test]
    async fn test_file_source_filters_to_tracked_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentiment.json");
        let body = json!({
            "reddit": {
                "AAPL": {"avg_sentiment": 0.21, "sentiment_std": 0.4, "comments": 120},
                "GME": {"avg_sentiment": 0.9}
            },
            "news": {"MSFT": {"avg_sentiment": -0.05}}
        });
        std::fs::write(&path, body.to_string()).unwrap();

        let sources = FileSentimentSource::discover(&path).await.unwrap();
        let names: Vec<String> = sources.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["news", "reddit"]);

        let reddit = FileSentimentSource::new("reddit", &path);
        let snapshot = reddit.snapshot(&symbols()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["AAPL"]["comments"], json!(120));
    }

    #[tokio::test]
    async fn test_failing_source_is_omitted() {
        let mut healthy = MockSentimentSource::new();
        healthy.expect_name().return_const("news".to_string());
        healthy
            .expect_snapshot()
            .returning(|_| Ok(BTreeMap::from([("AAPL".to_string(), json!({"score": 0.3}))])));

        let mut broken = MockSentimentSource::new();
        broken.expect_name().return_const("reddit".to_string());
        broken
            .expect_snapshot()
            .returning(|_| Err(anyhow!("rate limited")));

        let sources: Vec<Arc<dyn SentimentSource>> = vec![Arc::new(healthy), Arc::new(broken)];
        let report = collect_sentiment(&sources, &symbols()).await;
        assert_eq!(report.len(), 1);
        assert!(report.contains_key("news"));
    }

    #[tokio::test]
    async fn test_file_is_reread_between_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentiment.json");
        tokio::fs::write(&path, json!({"reddit": {"AAPL": {"comments": 1}}}).to_string())
            .await
            .unwrap();

        let reddit = FileSentimentSource::new("reddit", &path);
        assert_eq!(reddit.snapshot(&symbols()).await.unwrap()["AAPL"]["comments"], json!(1));

        tokio::fs::write(&path, json!({"reddit": {"AAPL": {"comments": 7}}}).to_string())
            .await
            .unwrap();
        assert_eq!(reddit.snapshot(&symbols()).await.unwrap()["AAPL"]["comments"], json!(7));

        tokio::fs::write(&path, json!({"news": {}}).to_string()).await.unwrap();
        assert!(reddit.snapshot(&symbols()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        assert!(FileSentimentSource::discover("/nonexistent/sentiment.json")
            .await
            .is_err());
        let source = FileSentimentSource::new("reddit", "/nonexistent/sentiment.json");
        assert!(source.snapshot(&symbols()).await.is_err());
    }
}
