// src/aggregate.rs
//! Replicate aggregation over a normalized results table.
//!
//! Rows are grouped by every configuration column except the independent
//! variable and the replicate column (usually `seed`). Within each group a
//! metric is summarized per x value as mean ± 1.96 standard errors.

use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::constants::Z_95;

/// One CSV row keyed by header
pub type Row = BTreeMap<String, String>;

/// Columns that describe a trial's configuration; everything else is a measurement
pub const CONFIG_COLUMNS: &[&str] = &[
    "experiment", "branch", "block size", "block_group_size", "workload", "scalefactor",
    "selectivity", "clustering", "indexes", "shared_buffers", "work_mem",
    "synchronize_seqscans", "pbm_evict_num_samples", "pbm_bg_naest_max_age",
    "pbm_evict_num_victims", "pbm_evict_use_freq", "pbm_evict_use_idx_scan",
    "pbm_idx_scan_num_counts", "pbm_lru_if_not_requested", "parallelism", "time",
    "count_multiplier", "prewarm", "seed", "query_order_randomized",
];

#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub metric: String,
    pub x: String,
    pub replicate: String,
}

impl AggregateSpec {
    /// Columns identifying a series
    pub fn key_columns(&self) -> Vec<&'static str> {
        CONFIG_COLUMNS
            .iter()
            .copied()
            .filter(|c| *c != self.x && *c != self.replicate)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    /// Values of [`AggregateSpec::key_columns`], same order
    pub series: Vec<String>,
    pub x: String,
    pub n: usize,
    pub mean: f64,
    /// 95% confidence half width; `None` for a single replicate
    pub ci95: Option<f64>,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (Bessel's correction)
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

pub fn ci95_half_width(values: &[f64]) -> Option<f64> {
    sample_std(values).map(|s| Z_95 * s / (values.len() as f64).sqrt())
}

/// Numeric x values sort numerically and before anything else, which sorts
/// lexically. Total, so NaN and mixed columns are fine.
fn cmp_x(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

pub fn aggregate(rows: &[Row], spec: &AggregateSpec) -> Result<Vec<SeriesPoint>> {
    let keys = spec.key_columns();
    let mut groups: BTreeMap<Vec<String>, Vec<(String, f64)>> = BTreeMap::new();

    for row in rows {
        let Some(raw) = row.get(&spec.metric) else {
            bail!("column '{}' not found", spec.metric);
        };
        let Some(x) = row.get(&spec.x) else {
            bail!("column '{}' not found", spec.x);
        };
        let y: f64 = match raw.trim() {
            "" => {
                debug!("{}: empty {}, skipping row", row.get("dir").map_or("?", |d| d.as_str()), spec.metric);
                continue;
            }
            v => v
                .parse()
                .with_context(|| format!("{} value '{}' is not numeric", spec.metric, v))?,
        };
        let series: Vec<String> = keys
            .iter()
            .map(|k| row.get(*k).cloned().unwrap_or_default())
            .collect();
        groups.entry(series).or_default().push((x.clone(), y));
    }

    let mut points = Vec::new();
    for (series, mut samples) in groups {
        samples.sort_by(|a, b| cmp_x(&a.0, &b.0));
        let mut i = 0;
        while i < samples.len() {
            let x = samples[i].0.clone();
            let values: Vec<f64> = samples[i..]
                .iter()
                .take_while(|(sx, _)| *sx == x)
                .map(|(_, y)| *y)
                .collect();
            i += values.len();
            points.push(SeriesPoint {
                series: series.clone(),
                x,
                n: values.len(),
                mean: mean(&values),
                ci95: ci95_half_width(&values),
            });
        }
    }
    info!("{} rows -> {} points", rows.len(), points.len());
    Ok(points)
}

pub fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec.with_context(|| format!("read {}", path.display()))?;
        rows.push(
            headers
                .iter()
                .zip(rec.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

pub fn write_points(points: &[SeriesPoint], spec: &AggregateSpec, out: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(out).with_context(|| format!("create {}", out.display()))?;
    let mut header: Vec<String> = spec.key_columns().iter().map(|s| s.to_string()).collect();
    header.push(spec.x.clone());
    header.push("n".into());
    header.push(format!("{}_mean", spec.metric));
    header.push(format!("{}_ci95", spec.metric));
    w.write_record(&header)?;

    for p in points {
        let mut rec = p.series.clone();
        rec.push(p.x.clone());
        rec.push(p.n.to_string());
        rec.push(p.mean.to_string());
        rec.push(p.ci95.map(|c| c.to_string()).unwrap_or_default());
        w.write_record(&rec)?;
    }
    w.flush()?;
    Ok(())
}
