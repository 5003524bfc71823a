use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "freshness.json";

/// Source of "now" for freshness decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Forecast model kind trained per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LstmUnivariate,
    LstmMultivariate,
    MlpUnivariate,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::LstmUnivariate,
        ModelKind::LstmMultivariate,
        ModelKind::MlpUnivariate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::LstmUnivariate => "lstm_univariate",
            ModelKind::LstmMultivariate => "lstm_multivariate",
            ModelKind::MlpUnivariate => "mlp_univariate",
        }
    }

    pub fn is_multivariate(&self) -> bool {
        matches!(self, ModelKind::LstmMultivariate)
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lstm_univariate" => Ok(ModelKind::LstmUnivariate),
            "lstm_multivariate" => Ok(ModelKind::LstmMultivariate),
            "mlp_univariate" => Ok(ModelKind::MlpUnivariate),
            _ => Err(anyhow!("Unknown model kind: {}", s)),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Missing,
    Fresh,
    Stale,
}

type Manifest = BTreeMap<ModelKind, DateTime<Utc>>;

/// Freshness records and serialized artifacts, one directory per asset.
///
/// Layout: `<models_dir>/<asset>/freshness.json` maps model kind to its
/// training time; `<models_dir>/<asset>/<kind>.json` holds the artifact.
/// Anything unreadable is treated as missing so the caller retrains.
pub struct ForecastCache {
    models_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ForecastCache {
    pub fn new(models_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            models_dir: models_dir.into(),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn asset_dir(&self, asset: &str) -> PathBuf {
        let safe: String = asset
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.models_dir.join(safe)
    }

    fn manifest_path(&self, asset: &str) -> PathBuf {
        self.asset_dir(asset).join(MANIFEST_FILE)
    }

    pub fn artifact_path(&self, asset: &str, kind: ModelKind) -> PathBuf {
        self.asset_dir(asset).join(kind.file_name())
    }

    fn read_manifest(&self, asset: &str) -> Manifest {
        let path = self.manifest_path(asset);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Manifest::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Unreadable freshness record {}: {}", path.display(), e);
                Manifest::new()
            }
        }
    }

    fn write_manifest(&self, asset: &str, manifest: &Manifest) -> Result<()> {
        let dir = self.asset_dir(asset);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = self.manifest_path(asset);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn trained_at(&self, asset: &str, kind: ModelKind) -> Option<DateTime<Utc>> {
        self.read_manifest(asset).get(&kind).copied()
    }

    pub fn status(&self, asset: &str, kind: ModelKind, ttl: Duration) -> Freshness {
        match self.trained_at(asset, kind) {
            None => Freshness::Missing,
            Some(created) if self.clock.now() - created > ttl => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }

    pub fn is_stale(&self, asset: &str, kind: ModelKind, ttl: Duration) -> bool {
        self.status(asset, kind, ttl) != Freshness::Fresh
    }

    pub fn record_trained(&self, asset: &str, kind: ModelKind, at: DateTime<Utc>) -> Result<()> {
        let mut manifest = self.read_manifest(asset);
        manifest.insert(kind, at);
        self.write_manifest(asset, &manifest)?;
        debug!("Recorded {} {} as trained at {}", asset, kind, at);
        Ok(())
    }

    pub fn save_artifact(&self, asset: &str, kind: ModelKind, json: &str) -> Result<()> {
        let dir = self.asset_dir(asset);
        std::fs::create_dir_all(&dir)?;
        let path = self.artifact_path(asset, kind);
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        Ok(())
    }

    pub fn load_artifact(&self, asset: &str, kind: ModelKind) -> Result<String> {
        let path = self.artifact_path(asset, kind);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Artifact not found: {}", path.display()))
    }
}
