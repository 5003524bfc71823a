pub mod cache;
pub mod model;
pub mod predictor;
pub mod scaler;
pub mod window;

pub use cache::{ForecastCache, ModelKind, SystemClock};
pub use model::LinearTrainer;
pub use predictor::{Forecast, ForecastError, Predictor, PredictorSettings};
