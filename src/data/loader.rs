use std::fs::{File, ReadDir};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use arrow::array::{Array, AsArray, Float32Array, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Schema};
use log::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::model::{CellKey, REQUIRED_RUL_INPUT};
use super::value::{NestedValue, first_numeral};
use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Raw document discovery
// ---------------------------------------------------------------------------

/// All `.json` files below `root`, sorted by path, truncated to `limit`.
///
/// Only an unreadable `root` is an error. Subdirectories that cannot be read
/// are logged and skipped, and symlinked directories are not followed.
pub fn discover_json(root: &Path, limit: Option<usize>) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root).with_context(|| format!("scanning {}", root.display()))?;
    let mut files = Vec::new();
    walk(entries, &mut files);
    files.sort();
    if let Some(limit) = limit {
        files.truncate(limit);
    }
    Ok(files)
}

fn walk(entries: ReadDir, out: &mut Vec<PathBuf>) {
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable directory entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => match std::fs::read_dir(&path) {
                Ok(sub) => walk(sub, out),
                Err(e) => warn!("skipping unreadable directory {}: {e}", path.display()),
            },
            Ok(_) if is_json(&path) => out.push(path),
            Ok(_) => {}
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

// ---------------------------------------------------------------------------
// Raw document parsing
// ---------------------------------------------------------------------------

/// Read and parse one raw test-report document.
///
/// The bytes are decoded as UTF-8 first and, if decoding or parsing fails,
/// once more as Latin-1. A document whose top level is a string holding JSON
/// is unwrapped before it is returned.
pub fn read_document(path: &Path) -> Result<NestedValue> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_document(&bytes)
}

/// Parse raw bytes the same way [`read_document`] does.
pub fn parse_document(bytes: &[u8]) -> Result<NestedValue> {
    let utf8 = std::str::from_utf8(bytes)
        .context("not valid UTF-8")
        .and_then(parse_unwrapped);
    match utf8 {
        Ok(doc) => Ok(doc),
        Err(first) => {
            debug!("UTF-8 parse failed ({first:#}), retrying as Latin-1");
            let text: String = bytes.iter().map(|&b| char::from(b)).collect();
            parse_unwrapped(&text).with_context(|| format!("after UTF-8 failure: {first:#}"))
        }
    }
}

/// Deepest bracket nesting accepted in a raw document. The extractor only
/// looks `max_depth` levels down, but anything shallower than this still
/// parses so that top-level fields are not lost.
pub const MAX_DOCUMENT_NESTING: usize = 512;

fn parse_unwrapped(text: &str) -> Result<NestedValue> {
    let root = parse_json(text).context("parsing JSON")?;
    let root = match root {
        JsonValue::String(inner) => {
            parse_json(&inner).context("parsing double-encoded JSON string")?
        }
        other => other,
    };
    Ok(NestedValue::from(root))
}

/// `serde_json` stops at 128 levels by default; lift that limit and cap the
/// depth ourselves before parsing so a hostile file cannot exhaust the stack.
fn parse_json(text: &str) -> Result<JsonValue> {
    let depth = nesting_depth(text);
    if depth > MAX_DOCUMENT_NESTING {
        bail!("document nests {depth} levels deep (limit {MAX_DOCUMENT_NESTING})");
    }
    let mut de = serde_json::Deserializer::from_str(text);
    de.disable_recursion_limit();
    let value = JsonValue::deserialize(&mut de)?;
    de.end()?;
    Ok(value)
}

/// Maximum `[`/`{` nesting outside string literals.
fn nesting_depth(text: &str) -> usize {
    let (mut depth, mut max) = (0usize, 0usize);
    let (mut in_string, mut escaped) = (false, false);
    for b in text.bytes() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                max = max.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

// ---------------------------------------------------------------------------
// Feature table loading
// ---------------------------------------------------------------------------

/// Older exports call the sequence column `week_idx`.
const LEGACY_SEQUENCE_COLUMN: &str = "week_idx";

/// One `(cell, time, SOH)` row read back from a feature table.
pub type SohRow = (CellKey, f64, Option<f64>);

/// Load the columns the RUL estimator needs from a feature table.
/// Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – as written by the `features` command, or any table with
///   string id columns and numeric `sequence_idx` / `SOH`
/// * `.csv`     – header row with the same column names
///
/// Missing required columns abort before any row is read.
pub fn load_soh_table(path: &Path) -> Result<Vec<SohRow>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "csv" => load_csv(path),
        other => Err(PipelineError::UnsupportedFormat(other.to_string()).into()),
    }
}

/// Resolve required column positions, naming every one that is missing.
fn locate_columns(names: impl Fn(&str) -> Option<usize>) -> Result<[usize; 4]> {
    let mut found = [0usize; 4];
    let mut missing = Vec::new();
    for (slot, col) in found.iter_mut().zip(REQUIRED_RUL_INPUT) {
        let idx = names(col).or_else(|| {
            (col == "sequence_idx")
                .then(|| names(LEGACY_SEQUENCE_COLUMN))
                .flatten()
        });
        match idx {
            Some(i) => *slot = i,
            None => missing.push(col.to_string()),
        }
    }
    if missing.is_empty() {
        Ok(found)
    } else {
        Err(PipelineError::MissingColumns { missing }.into())
    }
}

// -- CSV --

fn load_csv(path: &Path) -> Result<Vec<SohRow>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let [g_idx, c_idx, t_idx, s_idx] =
        locate_columns(|name| headers.iter().position(|h| h == name))?;

    let mut rows = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        let field = |i: usize| record.get(i).unwrap_or("").trim();
        let t = field(t_idx)
            .parse::<f64>()
            .with_context(|| format!("CSV row {row_no}: bad sequence index '{}'", field(t_idx)))?;
        let soh = match field(s_idx) {
            "" => None,
            s => first_numeral(s),
        };
        rows.push((CellKey::new(field(g_idx), field(c_idx)), t, soh));
    }
    Ok(rows)
}

// -- Parquet --

fn load_parquet(path: &Path) -> Result<Vec<SohRow>> {
    let file = File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let schema: Arc<Schema> = builder.schema().clone();
    let [g_idx, c_idx, t_idx, s_idx] = locate_columns(|name| schema.index_of(name).ok())?;
    let reader = builder.build().context("building parquet reader")?;

    let mut rows = Vec::new();
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let (g, c, t, s) = (
            batch.column(g_idx),
            batch.column(c_idx),
            batch.column(t_idx),
            batch.column(s_idx),
        );
        for row in 0..batch.num_rows() {
            let key = CellKey::new(
                string_at(g, row).context("group_id")?,
                string_at(c, row).context("cell_id")?,
            );
            let time = f64_at(t, row)
                .context("sequence_idx")?
                .ok_or_else(|| anyhow!("Row {row}: null sequence index"))?;
            let soh = f64_at(s, row).context("SOH")?;
            rows.push((key, time, soh));
        }
    }
    Ok(rows)
}

// -- Parquet / Arrow helpers --

fn string_at(col: &Arc<dyn Array>, row: usize) -> Result<String> {
    if col.is_null(row) {
        bail!("Row {row}: null identifier");
    }
    match col.data_type() {
        DataType::Utf8 => {
            let arr = col
                .as_any()
                .downcast_ref::<StringArray>()
                .context("expected StringArray")?;
            Ok(arr.value(row).to_string())
        }
        DataType::LargeUtf8 => Ok(col.as_string::<i64>().value(row).to_string()),
        other => bail!("Expected string column, got {other:?}"),
    }
}

/// Numeric cell as `f64`; nulls and non-finite values are absent.
fn f64_at(col: &Arc<dyn Array>, row: usize) -> Result<Option<f64>> {
    if col.is_null(row) {
        return Ok(None);
    }
    let v = match col.data_type() {
        DataType::Float64 => downcast::<Float64Array>(col)?.value(row),
        DataType::Float32 => f64::from(downcast::<Float32Array>(col)?.value(row)),
        DataType::Int64 => downcast::<Int64Array>(col)?.value(row) as f64,
        DataType::Int32 => f64::from(downcast::<Int32Array>(col)?.value(row)),
        other => bail!("Expected numeric column, got {other:?}"),
    };
    Ok(v.is_finite().then_some(v))
}

fn downcast<T: 'static>(col: &Arc<dyn Array>) -> Result<&T> {
    col.as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("unexpected array type {:?}", col.data_type()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_encoded_document_is_unwrapped() {
        let direct = parse_document(br#"{"capacity": 2.5, "meta": {"x": 1}}"#).unwrap();
        let wrapped = serde_json::to_string(r#"{"capacity": 2.5, "meta": {"x": 1}}"#).unwrap();
        let unwrapped = parse_document(wrapped.as_bytes()).unwrap();
        assert_eq!(direct, unwrapped);
    }

    #[test]
    fn broken_inner_json_is_an_error() {
        let wrapped = serde_json::to_string("{not json").unwrap();
        assert!(parse_document(wrapped.as_bytes()).is_err());
    }

    #[test]
    fn latin1_bytes_fall_back() {
        // 0xB5 is 'µ' in Latin-1 and invalid as a lone UTF-8 byte
        let mut bytes = br#"{"unit": "m"#.to_vec();
        bytes.push(0xB5);
        bytes.extend_from_slice(br#"Ah", "Q": 1.5}"#);
        let doc = parse_document(&bytes).unwrap();
        let NestedValue::Object(entries) = doc else {
            panic!("expected object");
        };
        assert_eq!(entries[0].1, NestedValue::String("mµAh".into()));
    }

    #[test]
    fn deep_nesting_keeps_top_level_fields() {
        let junk = format!("{}{}", "[".repeat(200), "]".repeat(200));
        let text = format!(r#"{{"capacity": 2.5, "junk": {junk}}}"#);
        let doc = parse_document(text.as_bytes()).unwrap();
        let sample = crate::data::extract::SignalExtractor::default().extract(&doc);
        assert_eq!(sample.capacity, Some(2.5));
    }

    #[test]
    fn brackets_inside_strings_do_not_nest() {
        assert_eq!(nesting_depth(r#"{"a": "[[[{", "b": ["x\"]"]}"#), 2);
    }

    #[test]
    fn absurd_nesting_is_rejected() {
        let depth = MAX_DOCUMENT_NESTING + 1;
        let text = format!("{}{}", "[".repeat(depth), "]".repeat(depth));
        let err = parse_document(text.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("levels deep"));
    }

    #[test]
    fn discovery_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("G1/C2")).unwrap();
        std::fs::create_dir_all(root.join("G1/C1")).unwrap();
        std::fs::write(root.join("G1/C2/a.json"), "{}").unwrap();
        std::fs::write(root.join("G1/C1/b.JSON"), "{}").unwrap();
        std::fs::write(root.join("G1/C1/notes.txt"), "").unwrap();

        let files = discover_json(root, None).unwrap();
        assert_eq!(files, vec![root.join("G1/C1/b.JSON"), root.join("G1/C2/a.json")]);
        assert_eq!(discover_json(root, Some(1)).unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn discovery_does_not_follow_directory_links() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("G1/C1")).unwrap();
        std::fs::write(root.join("G1/C1/a.json"), "{}").unwrap();
        // G1/C1/loop -> G1 would recurse forever if followed
        std::os::unix::fs::symlink(root.join("G1"), root.join("G1/C1/loop")).unwrap();

        let files = discover_json(root, None).unwrap();
        assert_eq!(files, vec![root.join("G1/C1/a.json")]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_json(&dir.path().join("absent"), None).is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_document(b"\xff\xfe not json at all").is_err());
    }

    #[test]
    fn missing_columns_are_all_named() {
        let present = ["group_id", "SOH"];
        let err = locate_columns(|n| present.iter().position(|p| *p == n)).unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        match err {
            PipelineError::MissingColumns { missing } => {
                assert_eq!(missing, vec!["cell_id", "sequence_idx"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn legacy_week_column_is_accepted() {
        let present = ["group_id", "cell_id", "week_idx", "SOH"];
        let idx = locate_columns(|n| present.iter().position(|p| *p == n)).unwrap();
        assert_eq!(idx, [0, 1, 2, 3]);
    }
}
