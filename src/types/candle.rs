use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Number of columns in a multivariate feature row: close, high, low, volume.
pub const FEATURE_COLUMNS: usize = 4;

/// Column of the close price inside a feature row.
pub const CLOSE_COLUMN: usize = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Feature row in the order the multivariate window expects.
    pub fn features(&self) -> [f64; FEATURE_COLUMNS] {
        [
            self.close.to_f64().unwrap_or(0.0),
            self.high.to_f64().unwrap_or(0.0),
            self.low.to_f64().unwrap_or(0.0),
            self.volume.to_f64().unwrap_or(0.0),
        ]
    }
}

/// Observed history of one asset, oldest bar first.
///
/// Bars are only ever appended by the feed that produced the series; consumers
/// borrow it read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    candles: Vec<Candle>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            candles: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn from_candles(symbol: impl Into<String>, candles: Vec<Candle>) -> Self {
        let mut series = Self::new(symbol);
        for candle in candles {
            series.push(candle);
        }
        series
    }

    /// Append a bar. Bars that do not move time forward are ignored.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.last() {
            if candle.timestamp <= last.timestamp {
                return false;
            }
        }
        self.candles.push(candle);
        true
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn closes(&self) -> Array1<f64> {
        self.candles
            .iter()
            .map(|c| c.close.to_f64().unwrap_or(0.0))
            .collect()
    }

    /// One row per bar: close, high, low, volume.
    pub fn feature_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.candles.len(), FEATURE_COLUMNS));
        for (i, candle) in self.candles.iter().enumerate() {
            for (j, value) in candle.features().iter().enumerate() {
                matrix[[i, j]] = *value;
            }
        }
        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn candle(hour: i64, close: Decimal) -> Candle {
        Candle {
            timestamp: DateTime::<Utc>::UNIX_EPOCH + Duration::hours(hour),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(1000),
        }
    }

    #[test]
    fn test_push_rejects_out_of_order_bars() {
        let mut series = PriceSeries::new("AAPL");
        assert!(series.push(candle(1, dec!(10))));
        assert!(!series.push(candle(1, dec!(11))));
        assert!(!series.push(candle(0, dec!(12))));
        assert!(series.push(candle(2, dec!(13))));
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().map(|c| c.close), Some(dec!(13)));
    }

    #[test]
    fn test_feature_matrix_layout() {
        let series = PriceSeries::from_candles("AAPL", vec![candle(0, dec!(10)), candle(1, dec!(20))]);
        let matrix = series.feature_matrix();
        assert_eq!(matrix.shape(), &[2, FEATURE_COLUMNS]);
        assert_eq!(matrix[[1, CLOSE_COLUMN]], 20.0);
        assert_eq!(matrix[[1, 1]], 21.0);
        assert_eq!(matrix[[1, 2]], 19.0);
        assert_eq!(matrix[[1, 3]], 1000.0);
        assert_eq!(series.closes().to_vec(), vec![10.0, 20.0]);
    }
}
