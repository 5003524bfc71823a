use chrono::{DateTime, Duration, Utc};
use ndarray::{Array2, Array3, Axis};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::cache::{ForecastCache, Freshness, ModelKind};
use super::model::{ModelTrainer, TrainedModel};
use super::scaler::ScalerBounds;
use super::window::{build_multivariate, build_univariate, WindowSet};
use crate::exchange::PriceFeed;
use crate::types::{PriceSeries, CLOSE_COLUMN, FEATURE_COLUMNS};

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("insufficient history for {asset}: {have} bars, need more than {need}")]
    InsufficientHistory { asset: String, have: usize, need: usize },

    #[error("{kind} model for {asset} is not ready")]
    ModelNotReady { asset: String, kind: ModelKind },

    #[error("training {kind} for {asset} failed: {source}")]
    Training {
        asset: String,
        kind: ModelKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("{kind} prediction for {asset} failed: {source}")]
    Prediction {
        asset: String,
        kind: ModelKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("price history for {asset} unavailable: {source}")]
    Feed {
        asset: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Per-kind forecast sequences, in price units, one entry per configured kind.
pub type Forecast = BTreeMap<ModelKind, Vec<f64>>;

#[derive(Debug, Clone)]
pub struct PredictorSettings {
    pub window_size: usize,
    pub ttl: Duration,
    pub kinds: Vec<ModelKind>,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            window_size: 6,
            ttl: Duration::hours(2),
            kinds: ModelKind::ALL.to_vec(),
        }
    }
}

/// Scaled windows plus the bounds fitted for this call only.
struct ScaledWindows {
    windows: WindowSet,
    target_bounds: ScalerBounds,
}

/// Cut windows for `kind` from `series` and min/max scale inputs and targets.
///
/// Bounds are refit on every call from whatever history is available, so two
/// calls on a grown series may scale differently.
fn scaled_windows(
    series: &PriceSeries,
    kind: ModelKind,
    window_size: usize,
) -> Result<ScaledWindows, ForecastError> {
    let have = series.len();
    if have <= window_size + 1 {
        return Err(ForecastError::InsufficientHistory {
            asset: series.symbol.clone(),
            have,
            need: window_size + 1,
        });
    }

    let closes = series.closes();
    let raw = if kind.is_multivariate() {
        build_multivariate(series.feature_matrix().view(), closes.view(), window_size)
    } else {
        build_univariate(closes.view(), window_size)
    };

    let flat = raw.flattened();
    let targets = raw.target_column();
    let (input_bounds, target_bounds) =
        match (ScalerBounds::fit(flat.view()), ScalerBounds::fit(targets.view())) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(ForecastError::InsufficientHistory {
                    asset: series.symbol.clone(),
                    have,
                    need: window_size + 1,
                })
            }
        };

    let shape = (raw.len(), raw.window_size(), raw.features());
    let inputs: Array3<f64> = input_bounds
        .transform(flat.view())
        .into_shape_with_order(shape)
        .map_err(|e| ForecastError::Training {
            asset: series.symbol.clone(),
            kind,
            source: e.into(),
        })?;
    let targets = target_bounds.transform(targets.view()).column(0).to_owned();

    Ok(ScaledWindows {
        windows: WindowSet { inputs, targets },
        target_bounds,
    })
}

/// Autoregressive rollout from the most recent scaled window.
///
/// Each step drops the oldest row and appends a copy of the newest one with
/// its close replaced by the prediction; other features are held.
fn rollout(
    model: &dyn TrainedModel,
    seed: Array2<f64>,
    horizon: usize,
) -> anyhow::Result<Vec<f64>> {
    let mut window = seed;
    let rows = window.nrows();
    let mut predictions = Vec::with_capacity(horizon);

    for _ in 0..horizon {
        let next = model.predict_one(window.view())?;
        predictions.push(next);

        if rows == 0 {
            continue;
        }
        let mut last = window.row(rows - 1).to_owned();
        last[CLOSE_COLUMN] = next;
        for t in 1..rows {
            let row = window.row(t).to_owned();
            window.row_mut(t - 1).assign(&row);
        }
        window.row_mut(rows - 1).assign(&last);
    }

    Ok(predictions)
}

/// Produces per-kind multi-step forecasts for one asset and keeps the
/// trained artifacts fresh.
pub struct Predictor {
    settings: PredictorSettings,
    feed: Arc<dyn PriceFeed>,
    trainer: Arc<dyn ModelTrainer>,
    cache: ForecastCache,
    artifacts: RwLock<HashMap<(String, ModelKind), Arc<dyn TrainedModel>>>,
}

impl Predictor {
    pub fn new(
        settings: PredictorSettings,
        feed: Arc<dyn PriceFeed>,
        trainer: Arc<dyn ModelTrainer>,
        cache: ForecastCache,
    ) -> Self {
        Self {
            settings,
            feed,
            trainer,
            cache,
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    /// Freshness of every configured kind for `asset`.
    pub fn freshness(&self, asset: &str) -> Vec<(ModelKind, Freshness, Option<DateTime<Utc>>)> {
        self.settings
            .kinds
            .iter()
            .map(|kind| {
                (
                    *kind,
                    self.cache.status(asset, *kind, self.settings.ttl),
                    self.cache.trained_at(asset, *kind),
                )
            })
            .collect()
    }

    /// Window shape a `kind` model must accept under the current settings.
    fn expected_shape(&self, kind: ModelKind) -> (usize, usize) {
        let features = if kind.is_multivariate() { FEATURE_COLUMNS } else { 1 };
        (self.settings.window_size, features)
    }

    /// In-memory artifact, falling back to the serialized copy on disk.
    /// An artifact fitted on a different window shape counts as absent.
    async fn artifact(&self, asset: &str, kind: ModelKind) -> Option<Arc<dyn TrainedModel>> {
        let key = (asset.to_string(), kind);
        let expected = self.expected_shape(kind);
        if let Some(model) = self.artifacts.read().await.get(&key) {
            if model.input_shape() == expected {
                return Some(model.clone());
            }
        }

        let json = self.cache.load_artifact(asset, kind).ok()?;
        match self.trainer.restore(kind, &json) {
            Ok(model) if model.input_shape() != expected => {
                info!(
                    "{} artifact for {} fitted on {:?}, need {:?}; retraining",
                    kind,
                    asset,
                    model.input_shape(),
                    expected
                );
                None
            }
            Ok(model) => {
                let model: Arc<dyn TrainedModel> = Arc::from(model);
                self.artifacts.write().await.insert(key, model.clone());
                debug!("Restored {} {} from disk", asset, kind);
                Some(model)
            }
            Err(e) => {
                warn!("Discarding unreadable {} artifact for {}: {}", kind, asset, e);
                None
            }
        }
    }

    async fn needs_training(&self, asset: &str, kind: ModelKind, force: bool) -> bool {
        if force || self.cache.is_stale(asset, kind, self.settings.ttl) {
            return true;
        }
        self.artifact(asset, kind).await.is_none()
    }

    /// Retrain every configured kind that is stale, missing, or unloadable.
    /// `force` retrains all of them. Returns the kinds that were trained.
    pub async fn train(&self, asset: &str, force: bool) -> Result<Vec<ModelKind>, ForecastError> {
        let mut due = Vec::new();
        for kind in &self.settings.kinds {
            if self.needs_training(asset, *kind, force).await {
                due.push(*kind);
            }
        }
        if due.is_empty() {
            debug!("All models for {} are fresh", asset);
            return Ok(due);
        }

        let series = self
            .feed
            .history(asset)
            .await
            .map_err(|source| ForecastError::Feed {
                asset: asset.to_string(),
                source,
            })?;

        for kind in &due {
            let kind = *kind;
            let scaled = scaled_windows(&series, kind, self.settings.window_size)?;

            let trainer = self.trainer.clone();
            let model = tokio::task::spawn_blocking(move || trainer.train(kind, &scaled.windows))
                .await
                .map_err(|e| ForecastError::Training {
                    asset: asset.to_string(),
                    kind,
                    source: e.into(),
                })?
                .map_err(|source| ForecastError::Training {
                    asset: asset.to_string(),
                    kind,
                    source,
                })?;
            let model: Arc<dyn TrainedModel> = Arc::from(model);

            match model.to_json() {
                Ok(json) => {
                    if let Err(e) = self.cache.save_artifact(asset, kind, &json) {
                        warn!("Could not persist {} artifact for {}: {}", kind, asset, e);
                    }
                }
                Err(e) => warn!("Could not serialize {} artifact for {}: {}", kind, asset, e),
            }

            self.artifacts
                .write()
                .await
                .insert((asset.to_string(), kind), model);

            if let Err(e) = self.cache.record_trained(asset, kind, self.cache.now()) {
                warn!("Could not record freshness of {} {}: {}", asset, kind, e);
            }
        }

        info!("Trained {} model(s) for {}: {:?}", due.len(), asset, due);
        Ok(due)
    }

    /// `horizon`-step forecast per configured kind, in price units.
    pub async fn forecast(&self, asset: &str, horizon: usize) -> Result<Forecast, ForecastError> {
        let mut models = Vec::with_capacity(self.settings.kinds.len());
        for kind in &self.settings.kinds {
            let model = self
                .artifact(asset, *kind)
                .await
                .ok_or_else(|| ForecastError::ModelNotReady {
                    asset: asset.to_string(),
                    kind: *kind,
                })?;
            models.push((*kind, model));
        }

        let series = self
            .feed
            .history(asset)
            .await
            .map_err(|source| ForecastError::Feed {
                asset: asset.to_string(),
                source,
            })?;

        let mut forecast = Forecast::new();
        for (kind, model) in models {
            let scaled = scaled_windows(&series, kind, self.settings.window_size)?;
            let last = scaled.windows.len() - 1;
            let seed = scaled.windows.inputs.index_axis(Axis(0), last).to_owned();

            let predictions =
                rollout(model.as_ref(), seed, horizon).map_err(|source| {
                    ForecastError::Prediction {
                        asset: asset.to_string(),
                        kind,
                        source,
                    }
                })?;
            forecast.insert(kind, scaled.target_bounds.inverse_column(&predictions));
        }

        debug!("Forecast {} for {} steps", asset, horizon);
        Ok(forecast)
    }
}
