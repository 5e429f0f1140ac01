use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

// ---------------------------------------------------------------------------
// CellKey – identity of one physical cell
// ---------------------------------------------------------------------------

pub const UNKNOWN_GROUP: &str = "GUNK";
pub const UNKNOWN_CELL: &str = "CUNK";

/// `(group_id, cell_id)` pair. Ordered so per-cell maps iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub group_id: String,
    pub cell_id: String,
}

impl CellKey {
    pub fn new(group_id: impl Into<String>, cell_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            cell_id: cell_id.into(),
        }
    }

    /// Best-effort identity from path tokens such as `.../G3/C12/rpt_4.json`.
    ///
    /// A token is `G` or `C` (any case) plus digits, starting a path component
    /// and ending at a word boundary, so `rpt_C5.json` or `G10C3` carry no
    /// identity. The first token of each kind wins. Missing tokens fall back
    /// to `GUNK` / `CUNK`.
    pub fn from_path(path: &Path) -> Self {
        static GROUP: OnceLock<Regex> = OnceLock::new();
        static CELL: OnceLock<Regex> = OnceLock::new();
        let group_re =
            GROUP.get_or_init(|| Regex::new(r"(?i)(?:^|/)(g\d+)\b").expect("group pattern is valid"));
        let cell_re =
            CELL.get_or_init(|| Regex::new(r"(?i)(?:^|/)(c\d+)\b").expect("cell pattern is valid"));

        let s = path.to_string_lossy().replace('\\', "/");
        let token = |re: &Regex, fallback: &str| {
            re.captures(&s)
                .and_then(|c| c.get(1))
                .map_or_else(|| fallback.to_string(), |m| m.as_str().to_ascii_uppercase())
        };
        Self {
            group_id: token(group_re, UNKNOWN_GROUP),
            cell_id: token(cell_re, UNKNOWN_CELL),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.cell_id)
    }
}

// ---------------------------------------------------------------------------
// CellObservation – one usable raw document
// ---------------------------------------------------------------------------

/// A single capacity measurement attributed to a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellObservation {
    pub sequence_idx: i64,
    pub capacity: f64,
    pub avg_v_chg: Option<f64>,
    pub avg_v_dchg: Option<f64>,
    pub dod: Option<f64>,
}

// ---------------------------------------------------------------------------
// Output rows
// ---------------------------------------------------------------------------

/// One row of the per-record feature table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub group_id: String,
    pub cell_id: String,
    pub sequence_idx: i64,
    pub soh: Option<f64>,
    pub soh_next: Option<f64>,
    pub weeks_since_start: i64,
    pub local_slope_k: Option<f64>,
    pub n_points_cell: usize,
    pub avg_v_chg: Option<f64>,
    pub avg_v_dchg: Option<f64>,
    pub delta_v_hyst: Option<f64>,
    pub cap_fade: Option<f64>,
    pub dod: Option<f64>,
    pub c_rate: Option<f64>,
    /// Kalman-smoothed SOH; only populated when smoothing is enabled.
    pub soh_kf: Option<f64>,
}

/// Per-cell outcome of the RUL estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct RulRecord {
    pub group_id: String,
    pub cell_id: String,
    pub k_used: usize,
    pub threshold: f64,
    /// Time coordinate of the fit origin.
    pub origin_idx_value: Option<f64>,
    pub slope: Option<f64>,
    pub intercept: Option<f64>,
    /// Where the fitted line meets the threshold.
    pub x_star: Option<f64>,
    pub rul_pred: Option<f64>,
    pub rul_true: Option<f64>,
    pub censored: bool,
    pub n_points: usize,
}

/// One row of the cycle-level feature table.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRow {
    /// File name of the source document.
    pub file: String,
    pub group_id: String,
    pub cell_id: String,
    pub capacity_charge_ah: Option<f64>,
    pub capacity_discharge_ah: Option<f64>,
    pub dod: Option<f64>,
    pub avg_v_chg: Option<f64>,
    pub avg_v_dchg: Option<f64>,
    pub c_rate_chg: Option<f64>,
    pub c_rate_dchg: Option<f64>,
}

/// Column names of the feature table, in write order.
pub const FEATURE_COLUMNS: [&str; 14] = [
    "group_id",
    "cell_id",
    "sequence_idx",
    "SOH",
    "SOH_next",
    "weeks_since_start",
    "local_slope_k",
    "n_points_cell",
    "avgV_chg",
    "avgV_dchg",
    "deltaV_hyst",
    "cap_fade",
    "DoD",
    "C_rate",
];

/// Optional smoothed-SOH column appended when smoothing is on.
pub const SOH_KF_COLUMN: &str = "SOH_kf";

/// Columns the estimator cannot run without.
pub const REQUIRED_RUL_INPUT: [&str; 4] = ["group_id", "cell_id", "sequence_idx", "SOH"];

/// Column names of the RUL table, in write order.
pub const RUL_COLUMNS: [&str; 12] = [
    "group_id",
    "cell_id",
    "k_used",
    "threshold",
    "origin_idx_value",
    "slope",
    "intercept",
    "x_star",
    "RUL_pred",
    "RUL_true",
    "censored",
    "n_points",
];

/// Column names of the cycle-level feature table, in write order.
pub const CYCLE_COLUMNS: [&str; 10] = [
    "file",
    "group_id",
    "cell_id",
    "capacity_charge_Ah",
    "capacity_discharge_Ah",
    "DoD",
    "avgV_chg",
    "avgV_dchg",
    "C_rate_chg",
    "C_rate_dchg",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn identity_from_directories() {
        let key = CellKey::from_path(&PathBuf::from("/data/RPT_json/g2/c14/rpt_03.json"));
        assert_eq!(key, CellKey::new("G2", "C14"));
    }

    #[test]
    fn identity_from_file_name() {
        let key = CellKey::from_path(&PathBuf::from("raw/G10/C3.json"));
        assert_eq!(key, CellKey::new("G10", "C3"));
    }

    #[test]
    fn tokens_inside_file_names_are_ignored() {
        let key = CellKey::from_path(&PathBuf::from("/data/G1/C1/rpt_C5.json"));
        assert_eq!(key, CellKey::new("G1", "C1"));

        let key = CellKey::from_path(&PathBuf::from("/data/G10C3_week5.json"));
        assert_eq!(key, CellKey::new(UNKNOWN_GROUP, UNKNOWN_CELL));
    }

    #[test]
    fn first_token_wins() {
        let key = CellKey::from_path(&PathBuf::from("/data/G2/C4/archive/C9/x.json"));
        assert_eq!(key, CellKey::new("G2", "C4"));
    }

    #[test]
    fn identity_handles_backslashes() {
        let key = CellKey::from_path(&PathBuf::from(r"C:\data\G1\C2\x.json"));
        // the drive letter is not followed by digits and is skipped
        assert_eq!(key, CellKey::new("G1", "C2"));
    }

    #[test]
    fn identity_defaults_to_unknown() {
        let key = CellKey::from_path(&PathBuf::from("/data/Cycle_json/report.json"));
        assert_eq!(key, CellKey::new(UNKNOWN_GROUP, UNKNOWN_CELL));
    }

    #[test]
    fn letters_before_token_do_not_count() {
        let key = CellKey::from_path(&PathBuf::from("/tmp/abc12/xg7/G4/file.json"));
        assert_eq!(key.group_id, "G4");
        assert_eq!(key.cell_id, UNKNOWN_CELL);
    }
}
