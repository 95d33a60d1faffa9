// src/collect.rs
//! Normalize completed trial directories into one flat CSV table.
//!
//! Each results directory holds a `test_config.json` record and one
//! `{branch}_blksz{block_size}` subdirectory with the load generator output:
//! `summary.json`, `metrics.json`, an optional `stream_times.json` (per-stream
//! completion times in microseconds) and an optional `iostats.json`.
//!
//! Problems with one directory never stop the collection: it is skipped with a
//! warning and the rest is processed.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::constants;
use crate::error::HarnessError;
use crate::glob_to_regex;

/// One normalized row, keyed by column name
pub type Record = BTreeMap<String, Value>;

/// Block device counters, in /sys/block/<dev>/stat order
pub const SYSBLOCKSTAT_COLS: &[&str] = &[
    "read_ios",
    "read_merges",
    "read_sectors",
    "read_ticks",
    "write_ios",
    "write_merges",
    "write_sectors",
    "write_ticks",
    "in_flight",
    "io_ticks",
    "time_in_queue",
];

const STATIO_MAIN_COLS: &[&str] = &["heap_blks_hit", "heap_blks_read", "idx_blks_hit", "idx_blks_read"];
const STATIO_TOAST_COLS: &[&str] = &["tidx_blks_hit", "tidx_blks_read", "toast_blks_hit", "toast_blks_read"];
const DBSTAT_COLS: &[&str] = &["active_time", "blk_read_time", "blks_hit", "blks_read"];

pub const LATENCY_COLS: &[&str] = &[
    "Average Latency (microseconds)",
    "Maximum Latency (microseconds)",
    "99th Percentile Latency (microseconds)",
    "95th Percentile Latency (microseconds)",
    "90th Percentile Latency (microseconds)",
    "75th Percentile Latency (microseconds)",
    "Median Latency (microseconds)",
    "25th Percentile Latency (microseconds)",
    "Minimum Latency (microseconds)",
];

/// Output schema. Fields a record lacks are written empty; fields not listed here are dropped.
pub const CSV_COLUMNS: &[&str] = &[
    // directory identity
    "experiment", "dir", "branch", "block size",
    // configuration record
    "block_group_size", "workload", "scalefactor", "selectivity", "clustering", "indexes",
    "shared_buffers", "work_mem", "synchronize_seqscans", "pbm_evict_num_samples",
    "pbm_bg_naest_max_age", "pbm_evict_num_victims", "pbm_evict_use_freq",
    "pbm_evict_use_idx_scan", "pbm_idx_scan_num_counts", "pbm_lru_if_not_requested",
    "parallelism", "time", "count_multiplier", "prewarm", "seed", "query_order_randomized",
    // block device deltas
    "read_ios", "read_merges", "read_sectors", "read_ticks", "write_ios", "write_merges",
    "write_sectors", "write_ticks", "in_flight", "io_ticks", "time_in_queue",
    // load generator summary
    "Throughput (requests/second)", "Goodput (requests/second)", "Benchmark Runtime (nanoseconds)",
    "Average Latency (microseconds)", "Maximum Latency (microseconds)",
    "99th Percentile Latency (microseconds)", "95th Percentile Latency (microseconds)",
    "90th Percentile Latency (microseconds)", "75th Percentile Latency (microseconds)",
    "Median Latency (microseconds)", "25th Percentile Latency (microseconds)",
    "Minimum Latency (microseconds)",
    // stream timing
    "average_stream_s", "max_stream_s",
    // buffer statistics
    "heap_blks_hit", "heap_blks_read", "idx_blks_hit", "idx_blks_read",
    "db_active_time", "db_blk_read_time", "db_blks_hit", "db_blks_read",
    "lineitem_heap_blks_hit", "lineitem_heap_blks_read", "lineitem_idx_blks_hit",
    "lineitem_idx_blks_read",
    // derived
    "hit_rate", "lineitem_hit_rate", "data_read_gb", "data_processed_gb",
];

fn artifact_err(path: &Path, message: impl std::fmt::Display) -> HarnessError {
    HarnessError::Artifact {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

fn read_json(path: &Path) -> Result<Value, HarnessError> {
    let text = fs::read_to_string(path).map_err(|e| artifact_err(path, e))?;
    serde_json::from_str(&text).map_err(|e| artifact_err(path, e))
}

/// Numeric value of a counter; the statistics views export numbers as strings
/// and unset counters as null.
fn num(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn int(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Block device counters for one run: the difference of a before/after pair,
/// or the document itself when it already holds deltas. A missing file is empty.
pub fn decode_iostats(path: &Path) -> Result<Map<String, Value>, HarnessError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let Value::Object(doc) = read_json(path)? else {
        return Err(artifact_err(path, "not a JSON object"));
    };

    let Some(after) = doc.get("after") else {
        return Ok(doc);
    };
    let after = after
        .as_object()
        .ok_or_else(|| artifact_err(path, "'after' snapshot is not an object"))?;
    // "before:" appears in files written by older capture scripts
    let before = doc
        .get("before")
        .or_else(|| doc.get("before:"))
        .and_then(Value::as_object)
        .ok_or_else(|| artifact_err(path, "has 'after' but no 'before' snapshot"))?;

    let mut delta = Map::new();
    for key in before.keys() {
        let d = int(after.get(key)) - int(before.get(key));
        delta.insert(key.clone(), Value::from(d));
    }
    Ok(delta)
}

/// Derived I/O metrics computed from the load generator's `metrics.json`
#[derive(Debug, Clone, PartialEq)]
pub struct IoMetrics {
    pub totals: BTreeMap<String, i64>,
    pub db_totals: BTreeMap<String, f64>,
    pub hit_rate: Option<f64>,
    pub lineitem_hit_rate: f64,
    pub data_read_gb: f64,
    pub data_processed_gb: f64,
}

impl IoMetrics {
    pub fn from_metrics(metrics: &Value, block_size_kib: u32) -> Result<Self, String> {
        let tables = metrics
            .get("pg_statio_user_tables")
            .and_then(Value::as_array)
            .ok_or("missing pg_statio_user_tables")?;
        let dbstat = metrics
            .get("pg_stat_database")
            .and_then(Value::as_array)
            .ok_or("missing pg_stat_database")?;

        let mut db_totals: BTreeMap<String, f64> = BTreeMap::new();
        for col in DBSTAT_COLS {
            let sum: f64 = dbstat.iter().map(|r| num(r.get(*col))).sum();
            db_totals.insert(format!("db_{}", col), sum);
        }

        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for col in STATIO_MAIN_COLS {
            totals.insert(col.to_string(), tables.iter().map(|r| int(r.get(*col))).sum());
            let large: i64 = tables
                .iter()
                .filter(|r| r.get("relname").and_then(Value::as_str) == Some(constants::LARGE_RELATION))
                .map(|r| int(r.get(*col)))
                .sum();
            totals.insert(format!("{}_{}", constants::LARGE_RELATION, col), large);
        }

        // toast relations are assumed idle; flag it when they are not
        for col in STATIO_TOAST_COLS {
            let sum: i64 = tables.iter().map(|r| int(r.get(*col))).sum();
            if sum > 0 {
                warn!("found non-zero toast values in column {}", col);
            }
        }

        let get = |k: &str| totals.get(k).copied().unwrap_or(0) as f64;
        let hits = get("heap_blks_hit") + get("idx_blks_hit");
        let reads = get("heap_blks_read") + get("idx_blks_read");
        let li_hits = get("lineitem_heap_blks_hit") + get("lineitem_idx_blks_hit");
        let li_reads = get("lineitem_heap_blks_read") + get("lineitem_idx_blks_read");

        let hit_rate = if hits + reads > 0.0 {
            Some(hits / (hits + reads))
        } else {
            None
        };
        let lineitem_hit_rate = if li_hits > 0.0 {
            li_hits / (li_hits + li_reads)
        } else {
            0.0
        };

        let blk = block_size_kib as f64;
        Ok(Self {
            totals,
            db_totals,
            hit_rate,
            lineitem_hit_rate,
            data_read_gb: reads * blk / constants::KIB_PER_GIB,
            data_processed_gb: (reads + hits) * blk / constants::KIB_PER_GIB,
        })
    }

    fn merge_into(&self, row: &mut Record) {
        for (k, v) in &self.totals {
            row.insert(k.clone(), Value::from(*v));
        }
        for (k, v) in &self.db_totals {
            row.insert(k.clone(), Value::from(*v));
        }
        row.insert(
            "hit_rate".into(),
            self.hit_rate.map(Value::from).unwrap_or(Value::Null),
        );
        row.insert("lineitem_hit_rate".into(), Value::from(self.lineitem_hit_rate));
        row.insert("data_read_gb".into(), Value::from(self.data_read_gb));
        row.insert("data_processed_gb".into(), Value::from(self.data_processed_gb));
    }
}

/// Average and maximum stream completion time in seconds
pub fn stream_time_summary(times_us: &[f64]) -> (Option<f64>, Option<f64>) {
    if times_us.is_empty() {
        return (None, None);
    }
    let avg = times_us.iter().sum::<f64>() / times_us.len() as f64 / constants::MICROS_PER_SEC;
    let max = times_us.iter().copied().fold(f64::MIN, f64::max) / constants::MICROS_PER_SEC;
    (Some(avg), Some(max))
}

/// Split `{branch}_blksz{block_size}`
pub fn parse_variant_dir(name: &str) -> Option<(String, u32)> {
    let (branch, blk) = name.rsplit_once("_blksz")?;
    if branch.is_empty() {
        return None;
    }
    Some((branch.to_string(), blk.parse().ok()?))
}

pub struct ResultsNormalizer {
    root: PathBuf,
    ignore: Vec<Regex>,
    sort_rows: bool,
}

impl ResultsNormalizer {
    /// `ignore` holds directory-name globs (`*` wildcard) to leave out
    pub fn new(root: impl Into<PathBuf>, ignore: &[String]) -> Result<Self> {
        let ignore = ignore
            .iter()
            .map(|g| Regex::new(&glob_to_regex(g)).with_context(|| format!("bad ignore pattern {}", g)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            root: root.into(),
            ignore,
            sort_rows: true,
        })
    }

    pub fn with_sorting(mut self, sort_rows: bool) -> Self {
        self.sort_rows = sort_rows;
        self
    }

    fn ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|re| re.is_match(name))
    }

    /// Rows for every usable results directory under the root
    pub fn collect(&self) -> Result<Vec<Record>> {
        let mut rows = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // the root itself cannot be listed
                Err(e) if e.depth() == 0 => {
                    return Err(e).with_context(|| format!("list {}", self.root.display()));
                }
                Err(e) => {
                    warn!("unreadable entry under {}, skipping: {}", self.root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.ignored(&name) {
                info!("Results directory {} marked as to-be-ignored, skipping...", name);
                continue;
            }
            match self.normalize_dir(entry.path()) {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => warn!("{}: could not read the load generator files, skipping: {:#}", name, e),
            }
        }

        if self.sort_rows {
            rows.sort_by(|a, b| cell(a.get("dir")).cmp(&cell(b.get("dir"))));
        }
        info!("Collected {} rows from {}", rows.len(), self.root.display());
        Ok(rows)
    }

    /// One row for a results directory. `Ok(None)` when it has no configuration
    /// record or no variant subdirectory.
    pub fn normalize_dir(&self, dir: &Path) -> Result<Option<Record>, HarnessError> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let config = match read_json(&dir.join(constants::TRIAL_CONFIG_FILE)) {
            Ok(Value::Object(c)) => c,
            Ok(_) | Err(_) => {
                warn!("{}: No config, skipping...", name);
                return Ok(None);
            }
        };

        let mut variants = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| artifact_err(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| artifact_err(dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let sub = entry.file_name().to_string_lossy().to_string();
            match parse_variant_dir(&sub) {
                Some(v) => variants.push(v),
                None => warn!("{}: subdirectory {} does not match {{branch}}_blksz{{n}}", name, sub),
            }
        }
        variants.sort();

        let Some((branch, blk)) = variants.first().cloned() else {
            warn!("{}: no variant subdirectory, skipping...", name);
            return Ok(None);
        };
        if variants.len() > 1 {
            warn!(
                "multiple subdirectories in {} ({}), using {}_blksz{}",
                name,
                variants.len(),
                branch,
                blk
            );
        }

        let sub = dir.join(format!("{}_blksz{}", branch, blk));
        let metrics = read_json(&sub.join(constants::METRICS_FILE))?;
        let summary = read_json(&sub.join(constants::SUMMARY_FILE))?;
        let stream_path = sub.join(constants::STREAM_TIMES_FILE);
        let stream_times: Vec<f64> = if stream_path.exists() {
            serde_json::from_value(read_json(&stream_path)?)
                .map_err(|e| artifact_err(&stream_path, e))?
        } else {
            Vec::new()
        };
        let iostats = decode_iostats(&sub.join(constants::IOSTATS_FILE))?;
        let io = IoMetrics::from_metrics(&metrics, blk)
            .map_err(|e| artifact_err(&sub.join(constants::METRICS_FILE), e))?;

        let (avg, max) = stream_time_summary(&stream_times);
        if stream_times.iter().any(|&t| t < 0.0) {
            warn!(
                "negative stream times for {}! e={}",
                name,
                cell(config.get("experiment"))
            );
        }

        let mut row = Record::new();
        row.insert("dir".into(), Value::from(name.clone()));
        row.insert("branch".into(), Value::from(branch));
        row.insert("block size".into(), Value::from(blk));
        row.insert("average_stream_s".into(), avg.map(Value::from).unwrap_or(Value::Null));
        row.insert("max_stream_s".into(), max.map(Value::from).unwrap_or(Value::Null));
        row.extend(config);
        row.extend(iostats);
        if let Value::Object(s) = &summary {
            for (k, v) in s {
                row.insert(k.clone(), v.clone());
            }
            if let Some(Value::Object(lat)) = s.get("Latency Distribution") {
                for (k, v) in lat {
                    row.insert(k.clone(), v.clone());
                }
            }
        }
        io.merge_into(&mut row);

        debug!("{}: {} fields", name, row.len());
        Ok(Some(row))
    }
}

/// CSV text for one value; null and missing are empty
pub fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn write_csv(rows: &[Record], out: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(out)
        .with_context(|| format!("create {}", out.display()))?;
    w.write_record(CSV_COLUMNS)?;
    for row in rows {
        w.write_record(CSV_COLUMNS.iter().map(|c| cell(row.get(*c))))?;
    }
    w.flush()?;
    info!("Wrote {} rows to {}", rows.len(), out.display());
    Ok(())
}
