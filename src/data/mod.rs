/// Data layer: document parsing, signal extraction, table I/O.
///
/// Architecture:
/// ```text
///  RPT_json/**/*.json, Cycle_json/**/*.json
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  bytes → NestedValue (Latin-1 retry, double-encoding unwrap)
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │ extract   │  alias-driven recursive scan → ExtractedSample / CycleSample
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  model    │  CellKey from path tokens, FeatureRow / RulRecord / CycleRow
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  writer   │  Arrow batches → .parquet / .csv
///   └──────────┘
/// ```

pub mod extract;
pub mod loader;
pub mod model;
pub mod value;
pub mod writer;
