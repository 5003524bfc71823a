use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Per-column min/max bounds fitted for a single forecast call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerBounds {
    pub min: Array1<f64>,
    pub max: Array1<f64>,
}

impl ScalerBounds {
    /// Fit bounds over the rows of `matrix`. Returns `None` for an empty matrix.
    pub fn fit(matrix: ArrayView2<f64>) -> Option<Self> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return None;
        }
        let min = matrix.fold_axis(Axis(0), f64::INFINITY, |acc, v| acc.min(*v));
        let max = matrix.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, v| acc.max(*v));
        Some(Self { min, max })
    }

    // constant columns keep scale 1 so the transform stays invertible
    fn scale(&self) -> Array1<f64> {
        Zip::from(&self.min)
            .and(&self.max)
            .map_collect(|lo, hi| if hi > lo { hi - lo } else { 1.0 })
    }

    /// Map into `[0, 1]` over the fitted range. Values outside it extrapolate.
    pub fn transform(&self, matrix: ArrayView2<f64>) -> Array2<f64> {
        let scale = self.scale();
        let mut out = matrix.to_owned();
        for row in out.rows_mut() {
            Zip::from(row)
                .and(&self.min)
                .and(&scale)
                .for_each(|v, lo, s| *v = (*v - lo) / s);
        }
        out
    }

    /// Inverse of a single-column fit applied to a flat sequence.
    pub fn inverse_column(&self, values: &[f64]) -> Vec<f64> {
        let lo = self.min.get(0).copied().unwrap_or(0.0);
        let scale = self.scale().get(0).copied().unwrap_or(1.0);
        values.iter().map(|v| v * scale + lo).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fit_transform_inverse() {
        let data = array![[10.0, 1.0], [20.0, 3.0], [15.0, 2.0]];
        let bounds = ScalerBounds::fit(data.view()).unwrap();
        assert_eq!(bounds.min, array![10.0, 1.0]);
        assert_eq!(bounds.max, array![20.0, 3.0]);

        let scaled = bounds.transform(data.view());
        assert_eq!(scaled, array![[0.0, 0.0], [1.0, 1.0], [0.5, 0.5]]);
        let closes = scaled.column(0).to_vec();
        assert_eq!(bounds.inverse_column(&closes), vec![10.0, 20.0, 15.0]);
    }

    #[test]
    fn test_values_outside_range_extrapolate() {
        let bounds = ScalerBounds::fit(array![[0.0], [10.0]].view()).unwrap();
        let scaled = bounds.transform(array![[20.0], [-5.0]].view());
        assert_eq!(scaled, array![[2.0], [-0.5]]);
        assert_eq!(bounds.inverse_column(&[2.0, -0.5]), vec![20.0, -5.0]);
    }

    #[test]
    fn test_constant_column_uses_unit_scale() {
        let bounds = ScalerBounds::fit(array![[5.0], [5.0]].view()).unwrap();
        let scaled = bounds.transform(array![[5.0], [7.0]].view());
        assert_eq!(scaled, array![[0.0], [2.0]]);
        assert_eq!(bounds.inverse_column(&[2.0]), vec![7.0]);
    }

    #[test]
    fn test_empty_matrix_has_no_bounds() {
        let empty: Array2<f64> = Array2::zeros((0, 3));
        assert!(ScalerBounds::fit(empty.view()).is_none());
    }
}
