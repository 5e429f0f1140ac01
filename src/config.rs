//! Run configuration.
//!
//! - `Config` and its sections are deserialized from TOML; every field has a
//!   default so a partial (or absent) file is valid.
//! - `validate` rejects values the estimator cannot work with and warns about
//!   values that are silently raised.
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::warn;
use serde::Deserialize;

use crate::data::extract::{Aliases, DEFAULT_LIST_DEPTH, DEFAULT_MAX_DEPTH, SignalExtractor};
use crate::error::PipelineError;
use crate::kalman::KalmanConfig;
use crate::rul::RulConfig;
use crate::soh::{FeatureOptions, MIN_TREND_POINTS};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Paths {
    /// Root of the raw JSON tree.
    pub data_root: PathBuf,
    /// Root of the cycle-level JSON tree; `<data_root>/Cycle_json` when unset.
    pub cycle_root: Option<PathBuf>,
    /// Where feature and RUL tables are written.
    pub out_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            cycle_root: None,
            out_dir: PathBuf::from("artifacts"),
        }
    }
}

impl Paths {
    pub fn cycle_root(&self) -> PathBuf {
        self.cycle_root
            .clone()
            .unwrap_or_else(|| self.data_root.join(CYCLE_SUBDIR))
    }
}

/// Default location of cycle-level documents below `data_root`.
pub const CYCLE_SUBDIR: &str = "Cycle_json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SohCfg {
    /// Window of the per-cell local slope; raised to 3 when smaller.
    pub min_points_for_trend: usize,
}

impl Default for SohCfg {
    fn default() -> Self {
        Self {
            min_points_for_trend: MIN_TREND_POINTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractCfg {
    pub max_depth: usize,
    /// How far into an aliased array its numbers are collected.
    pub list_depth: usize,
    pub aliases: Aliases,
}

impl Default for ExtractCfg {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            list_depth: DEFAULT_LIST_DEPTH,
            aliases: Aliases::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Process at most this many input files (after sorting).
    pub limit: Option<usize>,
    pub paths: Paths,
    pub soh: SohCfg,
    pub rul: RulConfig,
    pub extract: ExtractCfg,
    pub kalman: KalmanConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let threshold = self.rul.threshold;
        if !(threshold.is_finite() && threshold > 0.0 && threshold <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "rul.threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.rul.k == 0 {
            return Err(PipelineError::InvalidConfig("rul.k must be >= 1".into()));
        }
        if self.extract.aliases.capacity.names.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "extract.aliases.capacity must list at least one key".into(),
            ));
        }
        if self.limit == Some(0) {
            return Err(PipelineError::InvalidConfig("limit must be > 0 when set".into()));
        }
        if self.soh.min_points_for_trend < MIN_TREND_POINTS {
            warn!(
                "soh.min_points_for_trend = {} raised to {MIN_TREND_POINTS}",
                self.soh.min_points_for_trend
            );
        }
        Ok(())
    }

    pub fn extractor(&self) -> SignalExtractor {
        SignalExtractor::new(
            self.extract.aliases.clone(),
            self.extract.max_depth,
            self.extract.list_depth,
        )
    }

    pub fn feature_options(&self) -> FeatureOptions {
        FeatureOptions {
            min_points_for_trend: self.soh.min_points_for_trend.max(MIN_TREND_POINTS),
            kalman: self.kalman,
        }
    }
}

pub fn load_toml(text: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(text)
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    load_toml(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::extract::KeyMatch;
    use crate::rul::TimeUnit;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = load_toml("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.rul.threshold, 0.80);
        assert_eq!(cfg.rul.k, 4);
        assert_eq!(cfg.extract.max_depth, 10);
        assert_eq!(cfg.extract.list_depth, 3);
        cfg.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = load_toml(
            r#"
limit = 25

[paths]
data_root = "/data/isu-ilcc/RPT_json"
out_dir = "out"

[soh]
min_points_for_trend = 5

[rul]
threshold = 0.7
k = 6
time_unit = "cycles"

[extract.aliases.capacity]
names = ["Qdis", "cap_mAh"]

[extract.aliases.charge_voltage]
names = ["V_chg"]
match = "contains"

[kalman]
enabled = true
q = 1e-5
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.limit, Some(25));
        assert_eq!(cfg.paths.out_dir, PathBuf::from("out"));
        assert_eq!(cfg.feature_options().min_points_for_trend, 5);
        assert_eq!(cfg.rul.k, 6);
        assert_eq!(cfg.rul.time_unit, TimeUnit::Cycles);
        assert_eq!(cfg.extract.aliases.capacity.rule, KeyMatch::Exact);
        assert_eq!(cfg.extract.aliases.charge_voltage.rule, KeyMatch::Contains);
        // untouched alias sets keep their defaults
        assert_eq!(
            cfg.extract.aliases.discharge_voltage,
            Aliases::default().discharge_voltage
        );
        assert!(cfg.kalman.enabled);
        assert_eq!(cfg.kalman.r, 1e-3);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        for bad in ["0.0", "1.5", "-0.2"] {
            let cfg = load_toml(&format!("[rul]\nthreshold = {bad}\n")).unwrap();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("rul.threshold"), "{bad}");
        }
    }

    #[test]
    fn rejects_zero_k() {
        let cfg = load_toml("[rul]\nk = 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cycle_root_follows_data_root() {
        let cfg = load_toml("[paths]\ndata_root = \"/lab\"\n").unwrap();
        assert_eq!(cfg.paths.cycle_root(), PathBuf::from("/lab/Cycle_json"));

        let cfg = load_toml("[paths]\ncycle_root = \"/cycles\"\n").unwrap();
        assert_eq!(cfg.paths.cycle_root(), PathBuf::from("/cycles"));
    }

    #[test]
    fn small_trend_window_is_raised() {
        let cfg = load_toml("[soh]\nmin_points_for_trend = 1\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.feature_options().min_points_for_trend, 3);
    }
}
