use thiserror::Error;

/// Fatal conditions that stop a run.
///
/// Per-file and per-record problems never surface here: they are logged and
/// skipped by the loader and the series builder.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A feature table was read but lacks columns the estimator depends on.
    #[error("feature table is missing required columns: {}", missing.join(", "))]
    MissingColumns { missing: Vec<String> },

    /// The scan produced no record with a usable capacity, or a feature
    /// table holds no rows.
    #[error("no cell could be built from the input")]
    NoCells,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported table format: .{0}")]
    UnsupportedFormat(String),
}
