//! Scalar random-walk Kalman filter used to smooth SOH series.

use serde::Deserialize;

/// Filter tuning, read from the `[kalman]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    pub enabled: bool,
    /// Process noise variance.
    pub q: f64,
    /// Measurement noise variance.
    pub r: f64,
    /// Initial state variance.
    pub p0: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            q: 1e-6,
            r: 1e-3,
            p0: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Kalman1d {
    q: f64,
    r: f64,
    x: f64,
    p: f64,
}

impl Kalman1d {
    /// Non-positive variances fall back to the defaults.
    pub fn new(q: f64, r: f64, x0: f64, p0: f64) -> Self {
        let fallback = KalmanConfig::default();
        let positive = |v: f64, d: f64| if v > 0.0 { v } else { d };
        Self {
            q: positive(q, fallback.q),
            r: positive(r, fallback.r),
            x: x0,
            p: positive(p0, fallback.p0),
        }
    }

    pub fn state(&self) -> f64 {
        self.x
    }

    /// Fold one measurement in and return the posterior state.
    pub fn update(&mut self, z: f64) -> f64 {
        let p_prior = self.p + self.q;
        let s = p_prior + self.r;
        let gain = if s > 0.0 { p_prior / s } else { 0.0 };
        self.x += gain * (z - self.x);
        self.p = (1.0 - gain) * p_prior;
        self.x
    }
}

/// Smooth a series, starting from its first present value.
///
/// Absent measurements yield absent outputs and leave the filter untouched.
pub fn smooth(cfg: &KalmanConfig, series: &[Option<f64>]) -> Vec<Option<f64>> {
    let Some(x0) = series.iter().flatten().copied().next() else {
        return vec![None; series.len()];
    };
    let mut kf = Kalman1d::new(cfg.q, cfg.r, x0, cfg.p0);
    series
        .iter()
        .map(|z| z.map(|z| kf.update(z)))
        .collect()
}
