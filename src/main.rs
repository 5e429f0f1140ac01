use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use cell_rul::config::{self, Config};
use cell_rul::pipeline::{self, RUL_STEM};

#[derive(Parser, Debug)]
#[command(name = "cell-rul", version, about = "Battery SOH features and RUL estimation")]
struct Cli {
    /// Path to config TOML; defaults apply when omitted
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum TableFormat {
    Parquet,
    Csv,
}

impl TableFormat {
    fn ext(self) -> &'static str {
        match self {
            TableFormat::Parquet => "parquet",
            TableFormat::Csv => "csv",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a JSON tree and write the per-record feature table
    Features {
        /// Root of the raw JSON tree (overrides paths.data_root)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output directory (overrides paths.out_dir)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Process at most N files
        #[arg(long)]
        limit: Option<usize>,
        /// Window of the per-cell local slope (>= 3)
        #[arg(long)]
        min_points: Option<usize>,
        #[arg(long, value_enum, default_value = "parquet")]
        format: TableFormat,
    },
    /// Scan cycle-level JSON and write charge/discharge features
    Cycle {
        /// Root of the cycle JSON tree (overrides paths.cycle_root)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output directory (overrides paths.out_dir)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Process at most N files
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value = "parquet")]
        format: TableFormat,
    },
    /// Estimate RUL per cell from a feature table
    Rul {
        /// Feature table (.parquet or .csv)
        #[arg(long, default_value = "artifacts/features.parquet")]
        input: PathBuf,
        /// RUL table to write (.parquet or .csv)
        #[arg(long, default_value = "artifacts/rul_linear.parquet")]
        out: PathBuf,
        /// Last K SOH points used for the linear fit
        #[arg(long)]
        k: Option<usize>,
        /// End-of-life SOH threshold
        #[arg(long)]
        threshold: Option<f64>,
        /// Print the RUL table
        #[arg(long)]
        show: bool,
    },
    /// Run feature extraction and RUL estimation in one pass
    Run {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        k: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, value_enum, default_value = "parquet")]
        format: TableFormat,
        #[arg(long)]
        show: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => config::load_file(p),
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut cfg = load_config(cli.config.as_ref())?;

    match cli.cmd {
        Commands::Features {
            input,
            out,
            limit,
            min_points,
            format,
        } => {
            apply_paths(&mut cfg, input, out, limit);
            if let Some(n) = min_points {
                cfg.soh.min_points_for_trend = n;
            }
            cfg.validate()?;
            let run = pipeline::extract_features(&cfg)?;
            pipeline::write_features(&run, &cfg, format.ext())?;
        }
        Commands::Cycle {
            input,
            out,
            limit,
            format,
        } => {
            apply_paths(&mut cfg, None, out, limit);
            if input.is_some() {
                cfg.paths.cycle_root = input;
            }
            cfg.validate()?;
            let run = pipeline::extract_cycle_features(&cfg)?;
            pipeline::write_cycle_features(&run, &cfg, format.ext())?;
        }
        Commands::Rul {
            input,
            out,
            k,
            threshold,
            show,
        } => {
            apply_rul(&mut cfg, k, threshold);
            cfg.validate()?;
            let records = pipeline::estimate_from_table(&input, &cfg.rul)?;
            pipeline::write_rul(&records, &cfg.rul, &out)?;
            if show {
                println!("{}", pipeline::format_rul(&records)?);
            }
        }
        Commands::Run {
            input,
            out,
            limit,
            k,
            threshold,
            format,
            show,
        } => {
            apply_paths(&mut cfg, input, out, limit);
            apply_rul(&mut cfg, k, threshold);
            cfg.validate()?;
            let run = pipeline::extract_features(&cfg)?;
            pipeline::write_features(&run, &cfg, format.ext())?;
            let records = cell_rul::rul::estimate_series(&run.series, &cfg.rul);
            let out = cfg.paths.out_dir.join(format!("{RUL_STEM}.{}", format.ext()));
            pipeline::write_rul(&records, &cfg.rul, &out)?;
            if show {
                println!("{}", pipeline::format_rul(&records)?);
            }
        }
    }
    Ok(())
}

fn apply_paths(
    cfg: &mut Config,
    input: Option<PathBuf>,
    out: Option<PathBuf>,
    limit: Option<usize>,
) {
    if let Some(input) = input {
        cfg.paths.data_root = input;
    }
    if let Some(out) = out {
        cfg.paths.out_dir = out;
    }
    if limit.is_some() {
        cfg.limit = limit;
    }
}

fn apply_rul(cfg: &mut Config, k: Option<usize>, threshold: Option<f64>) {
    if let Some(k) = k {
        cfg.rul.k = k;
    }
    if let Some(t) = threshold {
        cfg.rul.threshold = t;
    }
}
