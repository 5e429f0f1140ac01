//! Trend-based remaining-useful-life estimation.
//!
//! For every cell the estimator picks a fit origin (the last point still above
//! the end-of-life threshold, or the newest point when the threshold was never
//! reached), fits a line through at most `k` points ending at that origin and
//! extrapolates it to the threshold.

use std::collections::BTreeMap;
use std::fmt;

use log::info;
use serde::Deserialize;

use crate::data::model::{CellKey, RulRecord};
use crate::soh::CellSeries;
use crate::trend::LineFit;

pub const DEFAULT_THRESHOLD: f64 = 0.80;
pub const DEFAULT_K: usize = 4;

/// Unit of the sequence axis, used for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Weeks,
    Cycles,
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeUnit::Weeks => write!(f, "weeks"),
            TimeUnit::Cycles => write!(f, "cycles"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RulConfig {
    /// End-of-life SOH.
    pub threshold: f64,
    /// Maximum number of points in the fit window.
    pub k: usize,
    pub time_unit: TimeUnit,
}

impl Default for RulConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            k: DEFAULT_K,
            time_unit: TimeUnit::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-cell estimation
// ---------------------------------------------------------------------------

/// Where the fit is anchored and what is known about the true crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Origin {
    /// Threshold never reached; anchor at the newest point.
    Censored { origin: usize },
    /// First point at or below the threshold is `cross`.
    Crossed { origin: usize, cross: usize },
}

impl Origin {
    fn classify(points: &[(f64, f64)], threshold: f64) -> Option<Self> {
        let last = points.len().checked_sub(1)?;
        Some(match points.iter().position(|&(_, soh)| soh <= threshold) {
            None => Origin::Censored { origin: last },
            Some(cross) => Origin::Crossed {
                origin: cross.saturating_sub(1),
                cross,
            },
        })
    }

    fn index(self) -> usize {
        match self {
            Origin::Censored { origin } | Origin::Crossed { origin, .. } => origin,
        }
    }
}

/// Fit outputs; every field absent when the window is too short.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Extrapolation {
    slope: Option<f64>,
    intercept: Option<f64>,
    x_star: Option<f64>,
    rul_pred: Option<f64>,
}

fn extrapolate(window: &[(f64, f64)], origin_x: f64, threshold: f64) -> Extrapolation {
    if window.len() < 2 {
        return Extrapolation::default();
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = window.iter().copied().unzip();
    let fit = LineFit::fit(&xs, &ys);
    let mut out = Extrapolation {
        slope: fit.finite_slope(),
        intercept: fit.finite_intercept(),
        ..Default::default()
    };
    if !fit.is_usable() || fit.slope >= 0.0 {
        return out;
    }

    let x_star = fit.solve_for(threshold);
    if !x_star.is_finite() {
        return out;
    }
    let rul = x_star - origin_x;
    out.x_star = Some(x_star);
    out.rul_pred = Some(if rul.is_finite() && rul > 0.0 { rul } else { 0.0 });
    out
}

/// Estimate one cell from its `(time, SOH)` points sorted by time.
///
/// `n_points` is set to `points.len()`; callers that dropped rows with an
/// absent SOH overwrite it with the raw row count.
pub fn estimate_cell(key: &CellKey, points: &[(f64, f64)], cfg: &RulConfig) -> RulRecord {
    let mut record = RulRecord {
        group_id: key.group_id.clone(),
        cell_id: key.cell_id.clone(),
        k_used: cfg.k,
        threshold: cfg.threshold,
        origin_idx_value: None,
        slope: None,
        intercept: None,
        x_star: None,
        rul_pred: None,
        rul_true: None,
        censored: true,
        n_points: points.len(),
    };
    let Some(origin) = Origin::classify(points, cfg.threshold) else {
        return record;
    };

    let o = origin.index();
    let origin_x = points[o].0;
    record.origin_idx_value = Some(origin_x);
    if let Origin::Crossed { cross, .. } = origin {
        record.censored = false;
        record.rul_true = Some((points[cross].0 - origin_x).max(0.0));
    }

    let start = o.saturating_sub(cfg.k.max(1) - 1);
    let fit = extrapolate(&points[start..=o], origin_x, cfg.threshold);
    record.slope = fit.slope;
    record.intercept = fit.intercept;
    record.x_star = fit.x_star;
    record.rul_pred = fit.rul_pred;
    record
}

/// Estimate every cell of a finalized scan.
pub fn estimate_series(series: &[CellSeries], cfg: &RulConfig) -> Vec<RulRecord> {
    series
        .iter()
        .map(|cell| RulRecord {
            n_points: cell.len(),
            ..estimate_cell(&cell.key, &cell.points(), cfg)
        })
        .collect()
}

/// Rows of one cell read back from a feature table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellRows {
    /// `(time, SOH)` pairs with a defined SOH, sorted by time.
    pub points: Vec<(f64, f64)>,
    /// Every row of the cell, including those with an absent SOH.
    pub rows: usize,
}

/// Group loose `(cell, time, SOH)` rows into sorted per-cell point lists.
///
/// Rows with an absent SOH are left out of `points` but still counted.
pub fn group_points<I>(rows: I) -> BTreeMap<CellKey, CellRows>
where
    I: IntoIterator<Item = (CellKey, f64, Option<f64>)>,
{
    let mut cells: BTreeMap<CellKey, CellRows> = BTreeMap::new();
    for (key, t, soh) in rows {
        let entry = cells.entry(key).or_default();
        entry.rows += 1;
        if let Some(soh) = soh {
            entry.points.push((t, soh));
        }
    }
    for cell in cells.values_mut() {
        cell.points.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    cells
}

/// Estimate every cell of a grouped table.
pub fn estimate_grouped(cells: &BTreeMap<CellKey, CellRows>, cfg: &RulConfig) -> Vec<RulRecord> {
    cells
        .iter()
        .map(|(key, cell)| RulRecord {
            n_points: cell.rows,
            ..estimate_cell(key, &cell.points, cfg)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Aggregate view of one estimation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RulSummary {
    pub cells: usize,
    pub censored: usize,
    /// Uncensored cells with both a true and a predicted RUL.
    pub evaluated: usize,
    /// Mean absolute error over the evaluated cells.
    pub mae: Option<f64>,
}

impl RulSummary {
    pub fn from_records(records: &[RulRecord]) -> Self {
        let errors: Vec<f64> = records
            .iter()
            .filter(|r| !r.censored)
            .filter_map(|r| Some((r.rul_true? - r.rul_pred?).abs()))
            .collect();
        Self {
            cells: records.len(),
            censored: records.iter().filter(|r| r.censored).count(),
            evaluated: errors.len(),
            mae: crate::data::value::mean(&errors),
        }
    }

    pub fn log(&self, unit: TimeUnit) {
        match self.mae {
            Some(mae) => info!(
                "RUL: {} cells ({} censored) | uncensored evaluated = {} | MAE ({unit}) = {mae:.3}",
                self.cells, self.censored, self.evaluated
            ),
            None => info!(
                "RUL: {} cells ({} censored) | no uncensored cells to evaluate",
                self.cells, self.censored
            ),
        }
    }
}
