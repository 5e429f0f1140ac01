//! Per-cell SOH series assembly and feature derivation.
//!
//! Observations arrive in file-processing order. Each cell gets its own
//! counter starting at 1, so `sequence_idx` reflects arrival order rather
//! than any timestamp embedded in the documents.

use std::collections::BTreeMap;

use log::debug;

use crate::data::extract::ExtractedSample;
use crate::data::model::{CellKey, CellObservation, FeatureRow};
use crate::error::PipelineError;
use crate::kalman::{self, KalmanConfig};
use crate::trend::LineFit;

/// Smallest window the per-cell local slope is computed over.
pub const MIN_TREND_POINTS: usize = 3;

// ---------------------------------------------------------------------------
// SeriesBuilder – accumulates observations during one scan
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SeriesBuilder {
    counters: BTreeMap<CellKey, i64>,
    cells: BTreeMap<CellKey, Vec<CellObservation>>,
}

impl SeriesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one extracted document for `key`.
    ///
    /// Samples without a capacity are dropped and do not advance the cell's
    /// counter. Returns the assigned sequence index otherwise.
    pub fn push(&mut self, key: CellKey, sample: &ExtractedSample) -> Option<i64> {
        let capacity = sample.capacity?;
        let counter = self.counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        let sequence_idx = *counter;

        if let Some(reported) = sample.reported_index {
            if reported != sequence_idx as f64 {
                debug!("{key}: document reports index {reported}, assigned {sequence_idx}");
            }
        }

        self.cells.entry(key).or_default().push(CellObservation {
            sequence_idx,
            capacity,
            avg_v_chg: sample.avg_v_charge,
            avg_v_dchg: sample.avg_v_discharge,
            dod: sample.depth_of_discharge(),
        });
        Some(sequence_idx)
    }

    /// Number of accepted observations across all cells.
    pub fn len(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Sort every cell and compute its SOH series.
    pub fn finish(self) -> Result<Vec<CellSeries>, PipelineError> {
        if self.cells.is_empty() {
            return Err(PipelineError::NoCells);
        }
        Ok(self
            .cells
            .into_iter()
            .map(|(key, obs)| CellSeries::new(key, obs))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// CellSeries – one finalized cell
// ---------------------------------------------------------------------------

/// Observations of one cell ordered by `sequence_idx`, with SOH normalized to
/// the first observation.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSeries {
    pub key: CellKey,
    pub observations: Vec<CellObservation>,
    pub soh: Vec<Option<f64>>,
}

impl CellSeries {
    pub fn new(key: CellKey, mut observations: Vec<CellObservation>) -> Self {
        observations.sort_by_key(|o| o.sequence_idx);
        observations.dedup_by_key(|o| o.sequence_idx);
        let first = observations.first().map(|o| o.capacity);
        let soh = observations
            .iter()
            .map(|o| first.and_then(|f| ratio(o.capacity, f)))
            .collect();
        Self {
            key,
            observations,
            soh,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn first_capacity(&self) -> Option<f64> {
        self.observations.first().map(|o| o.capacity)
    }

    /// `(sequence_idx, SOH)` pairs with a defined SOH, in order.
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.observations
            .iter()
            .zip(&self.soh)
            .filter_map(|(o, s)| s.map(|s| (o.sequence_idx as f64, s)))
            .collect()
    }

    /// Slope over the last `k` SOH points, absent with fewer points or any
    /// absent SOH in the window.
    pub fn local_slope(&self, k: usize) -> Option<f64> {
        if k == 0 || self.len() < k {
            return None;
        }
        let start = self.len() - k;
        let xs: Vec<f64> = self.observations[start..]
            .iter()
            .map(|o| o.sequence_idx as f64)
            .collect();
        let ys: Vec<f64> = self.soh[start..].iter().copied().collect::<Option<_>>()?;
        LineFit::fit(&xs, &ys).finite_slope()
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    let r = num / den;
    r.is_finite().then_some(r)
}

// ---------------------------------------------------------------------------
// Feature table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct FeatureOptions {
    pub min_points_for_trend: usize,
    pub kalman: KalmanConfig,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            min_points_for_trend: MIN_TREND_POINTS,
            kalman: KalmanConfig::default(),
        }
    }
}

/// Mean first capacity over all rows: each cell weighs as many times as it
/// has observations. Absent when zero or non-finite.
fn nominal_capacity(series: &[CellSeries]) -> Option<f64> {
    let (sum, rows) = series
        .iter()
        .filter_map(|cell| cell.first_capacity().map(|f| (f, cell.len())))
        .fold((0.0, 0usize), |(sum, rows), (first, n)| {
            (sum + first * n as f64, rows + n)
        });
    if rows == 0 {
        return None;
    }
    let nominal = sum / rows as f64;
    (nominal.is_finite() && nominal != 0.0).then_some(nominal)
}

/// Expand finalized series into per-record feature rows.
pub fn feature_rows(series: &[CellSeries], opts: &FeatureOptions) -> Vec<FeatureRow> {
    let k = opts.min_points_for_trend.max(MIN_TREND_POINTS);
    let nominal = nominal_capacity(series);

    let mut rows = Vec::with_capacity(series.iter().map(CellSeries::len).sum());
    for cell in series {
        let slope = cell.local_slope(k);
        let start = cell.observations.first().map_or(0, |o| o.sequence_idx);
        let smoothed = if opts.kalman.enabled {
            kalman::smooth(&opts.kalman, &cell.soh)
        } else {
            vec![None; cell.len()]
        };

        for (i, obs) in cell.observations.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| &cell.observations[p]);
            rows.push(FeatureRow {
                group_id: cell.key.group_id.clone(),
                cell_id: cell.key.cell_id.clone(),
                sequence_idx: obs.sequence_idx,
                soh: cell.soh[i],
                soh_next: cell.soh.get(i + 1).copied().flatten(),
                weeks_since_start: obs.sequence_idx - start,
                local_slope_k: slope,
                n_points_cell: cell.len(),
                avg_v_chg: obs.avg_v_chg,
                avg_v_dchg: obs.avg_v_dchg,
                delta_v_hyst: obs.avg_v_chg.zip(obs.avg_v_dchg).map(|(c, d)| c - d),
                cap_fade: prev.map(|p| obs.capacity - p.capacity),
                dod: obs.dod,
                c_rate: nominal.and_then(|n| ratio(obs.capacity, n)),
                soh_kf: smoothed[i],
            });
        }
    }
    rows
}
