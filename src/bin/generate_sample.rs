use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

/// Capacity after `week` weeks for a cell fading at `rate` per week with a
/// knee after `knee` weeks.
fn capacity(nominal: f64, rate: f64, knee: u32, week: u32) -> f64 {
    let w = f64::from(week);
    let accel = f64::from(week.saturating_sub(knee));
    nominal * (1.0 - rate * w - 0.5 * rate * accel * accel / 4.0)
}

fn curve(rng: &mut StdRng, center: f64, n: usize) -> Vec<f64> {
    (0..n).map(|_| center + rng.gen_range(-0.05..0.05)).collect()
}

/// One report document in one of several export layouts.
fn report(rng: &mut StdRng, layout: usize, week: u32, cap: f64) -> Value {
    let chg = curve(rng, 3.9, 16);
    let dchg = curve(rng, 3.55, 16);
    match layout % 4 {
        // flat
        0 => json!({
            "week_idx": week,
            "rpt_capacity_Ah": cap,
            "QV_charge_C_5": chg,
            "QV_discharge_C_5": dchg,
            "temperature_C": 25.0,
        }),
        // nested with per-step arrays and unit-suffixed strings
        1 => json!({
            "header": {"week": format!("week {week}"), "operator": "lab-2"},
            "tests": [
                {"type": "rpt", "steps": [
                    {"capacity_discharge_C_5": [cap * 0.999, cap * 1.001]},
                    {"capacity_charge_C_5": [cap * 1.01, cap * 1.012]},
                ]},
                {"type": "ocv", "QV_charge_C_2": chg, "QV_discharge_C_2": dchg},
            ],
        }),
        // array-rooted
        2 => json!([
            {"meta": {"rpt_index": week}},
            {"Capacity": format!("{cap:.4} Ah")},
            {"curves": {"QV_charge": chg, "QV_discharge": dchg}},
        ]),
        // double-encoded string
        _ => Value::String(
            json!({"week": week, "capacity_Ah": cap, "QV_discharge": dchg}).to_string(),
        ),
    }
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn main() -> Result<()> {
    let root = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("sample_data/RPT_json"), PathBuf::from);
    let mut rng = StdRng::seed_from_u64(42);

    let mut files = 0usize;
    for group in 1..=2u32 {
        for cell in 1..=3u32 {
            let nominal = rng.gen_range(2.9..3.1);
            let rate = rng.gen_range(0.004..0.012);
            let knee = rng.gen_range(8..20);
            let weeks = rng.gen_range(12..30);
            let layout = (group * 3 + cell) as usize;

            for week in 1..=weeks {
                let cap = capacity(nominal, rate, knee, week) + rng.gen_range(-0.005..0.005);
                let doc = report(&mut rng, layout, week, cap);
                let path = root
                    .join(format!("G{group}"))
                    .join(format!("C{cell}"))
                    .join(format!("rpt_{week:03}.json"));
                write_json(&path, &doc)?;
                files += 1;
            }
        }
    }

    // one unreadable file to show the skip path
    let broken = root.join("G1").join("C1").join("rpt_999.json");
    std::fs::write(&broken, b"{\"capacity\": 2.9,").context("writing broken sample")?;

    println!("Wrote {files} report documents (+1 broken) under {}", root.display());
    Ok(())
}
