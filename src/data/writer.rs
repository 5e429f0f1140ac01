use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use super::model::{
    CYCLE_COLUMNS, CycleRow, FEATURE_COLUMNS, FeatureRow, RUL_COLUMNS, RulRecord, SOH_KF_COLUMN,
};
use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Record batches
// ---------------------------------------------------------------------------

fn strings<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values))
}

fn ints(values: impl Iterator<Item = i64>) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(values))
}

fn floats(values: impl Iterator<Item = Option<f64>>) -> ArrayRef {
    Arc::new(Float64Array::from_iter(values))
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Arrow batch of the feature table; `SOH_kf` is appended when `with_kf`.
pub fn feature_batch(rows: &[FeatureRow], with_kf: bool) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = vec![
        strings(rows.iter().map(|r| r.group_id.as_str())),
        strings(rows.iter().map(|r| r.cell_id.as_str())),
        ints(rows.iter().map(|r| r.sequence_idx)),
        floats(rows.iter().map(|r| r.soh)),
        floats(rows.iter().map(|r| r.soh_next)),
        ints(rows.iter().map(|r| r.weeks_since_start)),
        floats(rows.iter().map(|r| r.local_slope_k)),
        ints(rows.iter().map(|r| to_i64(r.n_points_cell))),
        floats(rows.iter().map(|r| r.avg_v_chg)),
        floats(rows.iter().map(|r| r.avg_v_dchg)),
        floats(rows.iter().map(|r| r.delta_v_hyst)),
        floats(rows.iter().map(|r| r.cap_fade)),
        floats(rows.iter().map(|r| r.dod)),
        floats(rows.iter().map(|r| r.c_rate)),
    ];
    let mut names: Vec<&str> = FEATURE_COLUMNS.to_vec();
    if with_kf {
        columns.push(floats(rows.iter().map(|r| r.soh_kf)));
        names.push(SOH_KF_COLUMN);
    }
    batch(&names, columns)
}

/// Arrow batch of the per-cell RUL table.
pub fn rul_batch(records: &[RulRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        strings(records.iter().map(|r| r.group_id.as_str())),
        strings(records.iter().map(|r| r.cell_id.as_str())),
        ints(records.iter().map(|r| to_i64(r.k_used))),
        floats(records.iter().map(|r| Some(r.threshold))),
        floats(records.iter().map(|r| r.origin_idx_value)),
        floats(records.iter().map(|r| r.slope)),
        floats(records.iter().map(|r| r.intercept)),
        floats(records.iter().map(|r| r.x_star)),
        floats(records.iter().map(|r| r.rul_pred)),
        floats(records.iter().map(|r| r.rul_true)),
        Arc::new(BooleanArray::from_iter(records.iter().map(|r| Some(r.censored)))),
        ints(records.iter().map(|r| to_i64(r.n_points))),
    ];
    batch(&RUL_COLUMNS, columns)
}

/// Arrow batch of the cycle-level feature table.
pub fn cycle_batch(rows: &[CycleRow]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        strings(rows.iter().map(|r| r.file.as_str())),
        strings(rows.iter().map(|r| r.group_id.as_str())),
        strings(rows.iter().map(|r| r.cell_id.as_str())),
        floats(rows.iter().map(|r| r.capacity_charge_ah)),
        floats(rows.iter().map(|r| r.capacity_discharge_ah)),
        floats(rows.iter().map(|r| r.dod)),
        floats(rows.iter().map(|r| r.avg_v_chg)),
        floats(rows.iter().map(|r| r.avg_v_dchg)),
        floats(rows.iter().map(|r| r.c_rate_chg)),
        floats(rows.iter().map(|r| r.c_rate_dchg)),
    ];
    batch(&CYCLE_COLUMNS, columns)
}

fn batch(names: &[&str], columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    let fields: Vec<Field> = names
        .iter()
        .zip(&columns)
        .map(|(name, col)| {
            let nullable = matches!(col.data_type(), DataType::Float64);
            Field::new(*name, col.data_type().clone(), nullable)
        })
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).context("assembling record batch")
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Write a batch to `path`. Dispatch by extension: `.parquet` or `.csv`.
pub fn write_table(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "parquet" | "pq" => write_parquet(path, batch),
        "csv" => write_csv(path, batch),
        other => Err(PipelineError::UnsupportedFormat(other.to_string()).into()),
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), None).context("creating parquet writer")?;
    writer.write(batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

/// CSV with a header row; nulls become empty fields.
fn write_csv(path: &Path, batch: &RecordBatch) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("opening CSV for writing")?;
    let schema = batch.schema();
    writer
        .write_record(schema.fields().iter().map(|f| f.name().as_str()))
        .context("writing CSV header")?;

    for row in 0..batch.num_rows() {
        let record: Vec<String> = batch
            .columns()
            .iter()
            .map(|col| cell_text(col, row))
            .collect();
        writer
            .write_record(&record)
            .with_context(|| format!("writing CSV row {row}"))?;
    }
    writer.flush().context("flushing CSV")?;
    Ok(())
}

fn cell_text(col: &ArrayRef, row: usize) -> String {
    if col.is_null(row) {
        return String::new();
    }
    let any = col.as_any();
    if let Some(a) = any.downcast_ref::<StringArray>() {
        a.value(row).to_string()
    } else if let Some(a) = any.downcast_ref::<Int64Array>() {
        a.value(row).to_string()
    } else if let Some(a) = any.downcast_ref::<Float64Array>() {
        a.value(row).to_string()
    } else if let Some(a) = any.downcast_ref::<BooleanArray>() {
        a.value(row).to_string()
    } else {
        String::new()
    }
}
