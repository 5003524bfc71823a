use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cache::ModelKind;
use super::window::WindowSet;

/// A fitted one-step-ahead predictor. Inputs and outputs are in scaled units.
pub trait TrainedModel: Send + Sync {
    /// Predict the next close from one window shaped `(window_size, features)`.
    fn predict_one(&self, window: ArrayView2<f64>) -> Result<f64>;

    /// `(window_size, features)` the model was fitted on.
    fn input_shape(&self) -> (usize, usize);

    fn to_json(&self) -> Result<String>;
}

/// Trainable-predictor capability. The forecast pipeline does not care which
/// model family sits behind it.
pub trait ModelTrainer: Send + Sync {
    fn train(&self, kind: ModelKind, windows: &WindowSet) -> Result<Box<dyn TrainedModel>>;

    fn restore(&self, kind: ModelKind, json: &str) -> Result<Box<dyn TrainedModel>>;
}

#[derive(Debug, Clone, Copy)]
struct Hyperparams {
    iterations: usize,
    learning_rate: f64,
    l2: f64,
}

impl Hyperparams {
    fn for_kind(kind: ModelKind) -> Self {
        match kind {
            ModelKind::LstmUnivariate => Self { iterations: 2000, learning_rate: 0.1, l2: 1e-4 },
            ModelKind::LstmMultivariate => Self { iterations: 3000, learning_rate: 0.05, l2: 1e-4 },
            ModelKind::MlpUnivariate => Self { iterations: 1000, learning_rate: 0.1, l2: 1e-3 },
        }
    }
}

/// Persisted coefficients of a linear autoregressive model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearWeights {
    kind: ModelKind,
    window_size: usize,
    features: usize,
    coefficients: Vec<f64>,
    intercept: f64,
}

/// Ridge-regularised linear regressor over the flattened window.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: LinearWeights,
}

impl TrainedModel for LinearModel {
    fn predict_one(&self, window: ArrayView2<f64>) -> Result<f64> {
        let w = &self.weights;
        if window.nrows() != w.window_size || window.ncols() != w.features {
            return Err(anyhow!(
                "{} expects a {}x{} window, got {}x{}",
                w.kind,
                w.window_size,
                w.features,
                window.nrows(),
                window.ncols()
            ));
        }
        let z = window
            .iter()
            .zip(w.coefficients.iter())
            .fold(w.intercept, |acc, (x, c)| acc + x * c);
        Ok(z)
    }

    fn input_shape(&self) -> (usize, usize) {
        (self.weights.window_size, self.weights.features)
    }

    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.weights)?)
    }
}

/// Default trainer: one linear regressor per model kind, fit by batch
/// gradient descent with kind-specific hyperparameters.
#[derive(Debug, Clone)]
pub struct LinearTrainer {
    min_training_samples: usize,
}

impl LinearTrainer {
    pub fn new() -> Self {
        Self { min_training_samples: 2 }
    }

    fn fit(
        features: &Array2<f64>,
        targets: &Array1<f64>,
        params: Hyperparams,
    ) -> (Vec<f64>, f64) {
        let n = features.nrows();
        let num_features = features.ncols();

        let mut coefficients = vec![0.0; num_features];
        let mut intercept = 0.0;

        for _iter in 0..params.iterations {
            let mut grad_coef = vec![0.0; num_features];
            let mut grad_intercept = 0.0;

            for i in 0..n {
                let mut z = intercept;
                for j in 0..num_features {
                    z += coefficients[j] * features[[i, j]];
                }
                let error = z - targets[i];

                grad_intercept += error;
                for j in 0..num_features {
                    grad_coef[j] += error * features[[i, j]];
                }
            }

            intercept -= params.learning_rate * grad_intercept / n as f64;
            for j in 0..num_features {
                coefficients[j] -=
                    params.learning_rate * (grad_coef[j] / n as f64 + params.l2 * coefficients[j]);
            }
        }

        (coefficients, intercept)
    }
}

impl Default for LinearTrainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelTrainer for LinearTrainer {
    fn train(&self, kind: ModelKind, windows: &WindowSet) -> Result<Box<dyn TrainedModel>> {
        let n = windows.len();
        if n < self.min_training_samples {
            return Err(anyhow!(
                "Not enough training windows for {}: {} < {}",
                kind,
                n,
                self.min_training_samples
            ));
        }

        let flat = windows.flattened();
        let params = Hyperparams::for_kind(kind);
        let (coefficients, intercept) = Self::fit(&flat, &windows.targets, params);

        let model = LinearModel {
            weights: LinearWeights {
                kind,
                window_size: windows.window_size(),
                features: windows.features(),
                coefficients,
                intercept,
            },
        };

        let mse = flat
            .rows()
            .into_iter()
            .zip(windows.targets.iter())
            .map(|(row, target)| {
                let z = row
                    .iter()
                    .zip(model.weights.coefficients.iter())
                    .fold(model.weights.intercept, |acc, (x, c)| acc + x * c);
                (z - target).powi(2)
            })
            .sum::<f64>()
            / n as f64;

        info!("Trained {}: {} windows, mse={:.6}", kind, n, mse);
        Ok(Box::new(model))
    }

    fn restore(&self, kind: ModelKind, json: &str) -> Result<Box<dyn TrainedModel>> {
        let weights: LinearWeights = serde_json::from_str(json)?;
        if weights.kind != kind {
            return Err(anyhow!("Artifact holds {} weights, expected {}", weights.kind, kind));
        }
        if weights.coefficients.len() != weights.window_size * weights.features {
            return Err(anyhow!("Artifact for {} has inconsistent dimensions", kind));
        }
        debug!("Restored {} from artifact", kind);
        Ok(Box::new(LinearModel { weights }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::scaler::ScalerBounds;
    use crate::ml::window::build_univariate;
    use ndarray::{array, Array};

    fn scaled_trend() -> WindowSet {
        let series = Array::range(100.0, 160.0, 1.0);
        let mut windows = build_univariate(series.view(), 6);
        let flat = windows.flattened();
        let x_bounds = ScalerBounds::fit(flat.view()).unwrap();
        let y_bounds = ScalerBounds::fit(windows.target_column().view()).unwrap();
        let scaled = x_bounds.transform(flat.view());
        windows.inputs = scaled
            .into_shape_with_order((windows.len(), 6, 1))
            .unwrap();
        windows.targets = y_bounds.transform(windows.target_column().view()).column(0).to_owned();
        windows
    }

    #[test]
    fn test_fits_a_trend() {
        let windows = scaled_trend();
        let trainer = LinearTrainer::new();
        let model = trainer.train(ModelKind::MlpUnivariate, &windows).unwrap();

        let mse: f64 = windows
            .inputs
            .outer_iter()
            .zip(windows.targets.iter())
            .map(|(w, t)| (model.predict_one(w).unwrap() - t).powi(2))
            .sum::<f64>()
            / windows.len() as f64;
        assert!(mse < 0.02, "mse too high: {}", mse);
    }

    #[test]
    fn test_restore_round_trip() {
        let windows = scaled_trend();
        let trainer = LinearTrainer::new();
        let model = trainer.train(ModelKind::LstmUnivariate, &windows).unwrap();
        let json = model.to_json().unwrap();

        let restored = trainer.restore(ModelKind::LstmUnivariate, &json).unwrap();
        let window = windows.inputs.index_axis(ndarray::Axis(0), 0);
        assert_eq!(
            model.predict_one(window).unwrap(),
            restored.predict_one(window).unwrap()
        );
        assert!(trainer.restore(ModelKind::MlpUnivariate, &json).is_err());
    }

    #[test]
    fn test_rejects_wrong_window_shape() {
        let windows = scaled_trend();
        let model = LinearTrainer::new()
            .train(ModelKind::LstmUnivariate, &windows)
            .unwrap();
        assert_eq!(model.input_shape(), (6, 1));
        let bad = array![[0.1, 0.2], [0.3, 0.4]];
        assert!(model.predict_one(bad.view()).is_err());
    }

    #[test]
    fn test_too_few_windows() {
        let series = array![1.0, 2.0, 3.0];
        let windows = build_univariate(series.view(), 2);
        assert_eq!(windows.len(), 1);
        assert!(LinearTrainer::new().train(ModelKind::MlpUnivariate, &windows).is_err());
    }
}
