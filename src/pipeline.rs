//! Batch stages wiring the data layer to the estimators.
//!
//! Files are processed one at a time in sorted path order; a broken file is
//! logged and skipped without aborting the batch.

use std::path::{Path, PathBuf};

use anyhow::Result;
use arrow::util::pretty::pretty_format_batches;
use log::{debug, info, warn};

use crate::config::Config;
use crate::data::extract::SignalExtractor;
use crate::data::loader::{discover_json, load_soh_table, read_document};
use crate::data::model::{CellKey, CycleRow, FeatureRow, RulRecord};
use crate::data::writer::{cycle_batch, feature_batch, rul_batch, write_table};
use crate::error::PipelineError;
use crate::rul::{self, RulConfig, RulSummary};
use crate::soh::{self, CellSeries, SeriesBuilder};

pub const FEATURES_STEM: &str = "features";
pub const RUL_STEM: &str = "rul_linear";
pub const CYCLE_STEM: &str = "features_cycle";

/// Counters reported after a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files: usize,
    /// Files that could not be read or parsed.
    pub unreadable: usize,
    /// Parsed files with no capacity anywhere in them.
    pub no_capacity: usize,
    pub observations: usize,
}

/// Output of the feature stage.
#[derive(Debug, Clone)]
pub struct FeatureRun {
    pub series: Vec<CellSeries>,
    pub rows: Vec<FeatureRow>,
    pub stats: ScanStats,
}

/// Read, extract and accumulate every file in order.
pub fn scan(files: &[PathBuf], extractor: &SignalExtractor) -> (SeriesBuilder, ScanStats) {
    let mut builder = SeriesBuilder::new();
    let mut stats = ScanStats {
        files: files.len(),
        ..Default::default()
    };

    for path in files {
        let doc = match read_document(path) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("skipping unreadable file {}: {e:#}", path.display());
                stats.unreadable += 1;
                continue;
            }
        };
        let sample = extractor.extract(&doc);
        let key = CellKey::from_path(path);
        match builder.push(key, &sample) {
            Some(idx) => debug!("{}: capacity {:?} -> #{idx}", path.display(), sample.capacity),
            None => {
                debug!("{}: no capacity found ({} root)", path.display(), doc.kind());
                stats.no_capacity += 1;
            }
        }
    }
    stats.observations = builder.len();
    (builder, stats)
}

/// Scan `cfg.paths.data_root` and derive the per-record feature table.
pub fn extract_features(cfg: &Config) -> Result<FeatureRun> {
    let files = discover_json(&cfg.paths.data_root, cfg.limit)?;
    info!(
        "scanning {} JSON files under {}",
        files.len(),
        cfg.paths.data_root.display()
    );
    let (builder, stats) = scan(&files, &cfg.extractor());
    let series = builder.finish()?;
    let rows = soh::feature_rows(&series, &cfg.feature_options());
    info!(
        "features: {} rows over {} cells | {} unreadable, {} without capacity",
        rows.len(),
        series.len(),
        stats.unreadable,
        stats.no_capacity
    );
    Ok(FeatureRun {
        series,
        rows,
        stats,
    })
}

/// Write the feature table as `<out_dir>/features.<ext>`.
pub fn write_features(run: &FeatureRun, cfg: &Config, ext: &str) -> Result<PathBuf> {
    let path = cfg.paths.out_dir.join(format!("{FEATURES_STEM}.{ext}"));
    write_table(&path, &feature_batch(&run.rows, cfg.kalman.enabled)?)?;
    info!("saved feature table -> {} | rows={}", path.display(), run.rows.len());
    Ok(path)
}

// ---------------------------------------------------------------------------
// Cycle-level features
// ---------------------------------------------------------------------------

/// Output of the cycle-level feature stage.
#[derive(Debug, Clone)]
pub struct CycleRun {
    pub rows: Vec<CycleRow>,
    pub stats: ScanStats,
}

/// One row per readable cycle document; documents without any capacity are
/// kept with absent values and counted.
pub fn scan_cycles(files: &[PathBuf], extractor: &SignalExtractor) -> (Vec<CycleRow>, ScanStats) {
    let mut rows = Vec::with_capacity(files.len());
    let mut stats = ScanStats {
        files: files.len(),
        ..Default::default()
    };

    for path in files {
        let doc = match read_document(path) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("skipping unreadable file {}: {e:#}", path.display());
                stats.unreadable += 1;
                continue;
            }
        };
        let cycle = extractor.extract_cycle(&doc);
        if cycle.lacks_capacity() {
            debug!("{}: no charge or discharge capacity", path.display());
            stats.no_capacity += 1;
        }
        let key = CellKey::from_path(path);
        rows.push(CycleRow {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            group_id: key.group_id,
            cell_id: key.cell_id,
            capacity_charge_ah: cycle.capacity_charge,
            capacity_discharge_ah: cycle.capacity_discharge,
            dod: cycle.depth_of_discharge(),
            avg_v_chg: cycle.avg_v_charge,
            avg_v_dchg: cycle.avg_v_discharge,
            c_rate_chg: cycle.c_rate_charge(),
            c_rate_dchg: cycle.c_rate_discharge(),
        });
    }
    stats.observations = rows.len();
    (rows, stats)
}

/// Scan the cycle-level tree (`cfg.paths.cycle_root()`).
pub fn extract_cycle_features(cfg: &Config) -> Result<CycleRun> {
    let root = cfg.paths.cycle_root();
    let files = discover_json(&root, cfg.limit)?;
    info!("scanning {} cycle JSON files under {}", files.len(), root.display());
    let (rows, stats) = scan_cycles(&files, &cfg.extractor());
    if rows.is_empty() {
        warn!("no readable cycle documents under {}", root.display());
    }
    info!(
        "cycle features: {} rows | {} unreadable, {} without capacity",
        rows.len(),
        stats.unreadable,
        stats.no_capacity
    );
    Ok(CycleRun { rows, stats })
}

/// Write the cycle-level table as `<out_dir>/features_cycle.<ext>`.
pub fn write_cycle_features(run: &CycleRun, cfg: &Config, ext: &str) -> Result<PathBuf> {
    let path = cfg.paths.out_dir.join(format!("{CYCLE_STEM}.{ext}"));
    write_table(&path, &cycle_batch(&run.rows)?)?;
    info!("saved cycle table -> {} | rows={}", path.display(), run.rows.len());
    Ok(path)
}

// ---------------------------------------------------------------------------
// RUL
// ---------------------------------------------------------------------------

/// Load a feature table and estimate RUL per cell.
///
/// Fails before estimating anything when required columns are missing, and
/// when the table holds no rows at all.
pub fn estimate_from_table(input: &Path, cfg: &RulConfig) -> Result<Vec<RulRecord>> {
    let rows = load_soh_table(input)?;
    let cells = rul::group_points(rows);
    if cells.is_empty() {
        return Err(PipelineError::NoCells.into());
    }
    info!("loaded {} cells from {}", cells.len(), input.display());
    Ok(rul::estimate_grouped(&cells, cfg))
}

/// Log the evaluation summary and write the RUL table.
pub fn write_rul(records: &[RulRecord], cfg: &RulConfig, out: &Path) -> Result<RulSummary> {
    let summary = RulSummary::from_records(records);
    summary.log(cfg.time_unit);
    write_table(out, &rul_batch(records)?)?;
    info!("saved RUL table -> {} | rows={}", out.display(), records.len());
    Ok(summary)
}

/// Human-readable rendering of a RUL table.
pub fn format_rul(records: &[RulRecord]) -> Result<String> {
    Ok(pretty_format_batches(&[rul_batch(records)?])?.to_string())
}
