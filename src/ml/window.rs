use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

/// Supervised training pairs cut from a price history.
///
/// `inputs` is shaped `(windows, window_size, features)`; `targets[i]` is the
/// close observed immediately after window `i`. Oldest window first.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    pub inputs: Array3<f64>,
    pub targets: Array1<f64>,
}

impl WindowSet {
    fn empty(window_size: usize, features: usize) -> Self {
        Self {
            inputs: Array3::zeros((0, window_size, features)),
            targets: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.inputs.len_of(Axis(1))
    }

    pub fn features(&self) -> usize {
        self.inputs.len_of(Axis(2))
    }

    /// One row per window, timesteps laid out back to back.
    pub fn flattened(&self) -> Array2<f64> {
        let width = self.window_size() * self.features();
        let mut flat = Array2::zeros((self.len(), width));
        for (i, window) in self.inputs.outer_iter().enumerate() {
            for (j, value) in window.iter().enumerate() {
                flat[[i, j]] = *value;
            }
        }
        flat
    }

    /// Targets as a single-column matrix, the shape the scaler fits on.
    pub fn target_column(&self) -> Array2<f64> {
        self.targets.view().insert_axis(Axis(1)).to_owned()
    }
}

/// Windows over a close-only series. Produces `len - window_size` windows.
pub fn build_univariate(series: ArrayView1<f64>, window_size: usize) -> WindowSet {
    let features = series.view().insert_axis(Axis(1));
    build_multivariate(features, series, window_size)
}

/// Windows over full feature rows; the target is always the next close.
pub fn build_multivariate(
    features: ArrayView2<f64>,
    closes: ArrayView1<f64>,
    window_size: usize,
) -> WindowSet {
    let width = features.ncols();
    let len = features.nrows().min(closes.len());
    if window_size == 0 || len <= window_size {
        return WindowSet::empty(window_size, width);
    }

    let count = len - window_size;
    let mut inputs = Array3::zeros((count, window_size, width));
    let mut targets = Array1::zeros(count);
    for i in 0..count {
        inputs
            .slice_mut(s![i, .., ..])
            .assign(&features.slice(s![i..i + window_size, ..]));
        targets[i] = closes[i + window_size];
    }

    WindowSet { inputs, targets }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn test_window_count_boundaries() {
        let ws = 6;
        let short = Array::range(0.0, ws as f64, 1.0);
        assert!(build_univariate(short.view(), ws).is_empty());

        let exact = Array::range(0.0, (ws + 1) as f64, 1.0);
        let windows = build_univariate(exact.view(), ws);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows.targets[0], ws as f64);

        let longer = Array::range(0.0, 20.0, 1.0);
        assert_eq!(build_univariate(longer.view(), ws).len(), 20 - ws);
    }

    #[test]
    fn test_univariate_windows_slide_oldest_first() {
        let series = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let windows = build_univariate(series.view(), 3);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows.flattened(), array![[1.0, 2.0, 3.0], [2.0, 3.0, 4.0]]);
        assert_eq!(windows.targets, array![4.0, 5.0]);
        // input untouched
        assert_eq!(series, array![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_multivariate_target_is_next_close() {
        let features = array![
            [10.0, 11.0, 9.0, 100.0],
            [12.0, 13.0, 11.0, 110.0],
            [14.0, 15.0, 13.0, 120.0],
        ];
        let closes = features.column(0).to_owned();
        let windows = build_multivariate(features.view(), closes.view(), 2);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows.features(), 4);
        assert_eq!(windows.inputs[[0, 1, 3]], 110.0);
        assert_eq!(windows.targets[0], 14.0);
        assert_eq!(windows.flattened().ncols(), 8);
    }
}
