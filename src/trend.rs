//! Ordinary least-squares line fitting.

/// Result of fitting `y = slope * x + intercept`.
///
/// Degenerate inputs (fewer than two points, all `x` equal) produce NaN
/// coefficients instead of an error; callers check [`LineFit::is_usable`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LineFit {
    const DEGENERATE: LineFit = LineFit {
        slope: f64::NAN,
        intercept: f64::NAN,
    };

    /// Fit a straight line through `(x, y)` pairs.
    pub fn fit(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len().min(ys.len());
        if n < 2 {
            return Self::DEGENERATE;
        }
        let xs = &xs[..n];
        let ys = &ys[..n];
        let nf = n as f64;
        let mean_x = xs.iter().sum::<f64>() / nf;
        let mean_y = ys.iter().sum::<f64>() / nf;

        let (sxx, sxy) = xs
            .iter()
            .zip(ys)
            .fold((0.0, 0.0), |(sxx, sxy), (&x, &y)| {
                let dx = x - mean_x;
                (sxx + dx * dx, sxy + dx * (y - mean_y))
            });

        if sxx == 0.0 {
            return Self::DEGENERATE;
        }
        let slope = sxy / sxx;
        Self {
            slope,
            intercept: mean_y - slope * mean_x,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.slope.is_finite() && self.intercept.is_finite()
    }

    /// Slope if finite.
    pub fn finite_slope(&self) -> Option<f64> {
        self.slope.is_finite().then_some(self.slope)
    }

    /// Intercept if finite.
    pub fn finite_intercept(&self) -> Option<f64> {
        self.intercept.is_finite().then_some(self.intercept)
    }

    /// `x` at which the line reaches `y`; NaN or infinite when it never does.
    pub fn solve_for(&self, y: f64) -> f64 {
        (y - self.intercept) / self.slope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line_is_recovered() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let fit = LineFit::fit(&xs, &ys);
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.solve_for(7.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn noisy_points_fit_least_squares() {
        let fit = LineFit::fit(&[1.0, 2.0, 3.0], &[1.0, 2.0, 2.0]);
        assert!((fit.slope - 0.5).abs() < 1e-12);
        assert!((fit.intercept - (2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn single_point_is_degenerate() {
        let fit = LineFit::fit(&[1.0], &[0.9]);
        assert!(!fit.is_usable());
        assert_eq!(fit.finite_slope(), None);
    }

    #[test]
    fn vertical_cloud_is_degenerate() {
        let fit = LineFit::fit(&[2.0, 2.0, 2.0], &[0.9, 0.8, 0.7]);
        assert!(!fit.is_usable());
    }

    #[test]
    fn flat_line_never_reaches_other_level() {
        let fit = LineFit::fit(&[0.0, 1.0], &[1.0, 1.0]);
        assert_eq!(fit.slope, 0.0);
        assert!(!fit.solve_for(0.8).is_finite());
    }
}
