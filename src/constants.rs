// src/constants.rs
//
// Central location for the constants used throughout pgexp-bench.
// Config defaults, artifact file names and fixed tuning values all live here.

use std::time::Duration;

// =============================================================================
// Database connection defaults
// =============================================================================

/// Default PostgreSQL port on the benchmark host
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Default PostgreSQL user used by the load generator and psql
pub const DEFAULT_PG_USER: &str = "postgres";

/// Environment variable consulted for the database password (also read from .env)
pub const PG_PASSWORD_ENV: &str = "PGEXP_PG_PASSWORD";

/// Listen address written into postgresql.conf on every configuration push.
/// The benchmark host is assumed to be isolated from the public internet.
pub const LISTEN_ADDRESSES: &str = "*";

/// pg_hba.conf line appended by one-time initialization
pub const TRUST_ALL_HBA_LINE: &str = "host\tall\tall\t0.0.0.0/0\ttrust";

/// shared_buffers set by one-time initialization
pub const INITIAL_SHARED_BUFFERS: &str = "8GB";

/// shared_buffers used while building indexes or clustering tables
pub const RECONFIGURE_SHARED_BUFFERS: &str = "20GB";

// =============================================================================
// Service lifecycle timeouts
// =============================================================================

/// Upper bound on waiting for the server to accept connections after `pg_ctl start`
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on waiting for the server to shut down after `pg_ctl stop`
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for short remote commands (truncate, test -f, file transfer)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// SSH connect timeout (seconds)
pub const DEFAULT_SSH_TIMEOUT_SECS: u64 = 30;

/// Upper bound on one clone/configure/make/install step
pub const BUILD_STEP_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// Poll interval while waiting on a local child process with a deadline
pub const LOCAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Trial defaults
// =============================================================================

/// Default load-generator run time per trial
pub const DEFAULT_TRIAL_DURATION: Duration = Duration::from_secs(600);

/// Default number of load-generator terminals
pub const DEFAULT_TERMINALS: u32 = 8;

/// Default block sizes (KiB) built and tested
pub const DEFAULT_BLOCK_SIZES: &[u32] = &[8, 32];

/// Name of the unmodified upstream branch in the branch table
pub const BASE_BRANCH_NAME: &str = "base";

/// Used to determine the BRIN `pages_per_range`. Dividing by the scale factor keeps
/// the number of rows per range roughly constant. 128 is the default pages per range
/// and 8 (KiB) the default block size.
pub const BASE_PAGES_PER_RANGE: u32 = 128 * 8;

/// Placeholder substituted in index creation scripts
pub const PAGES_PER_RANGE_PLACEHOLDER: &str = "REPLACEME_BRIN_PAGES_PER_RANGE";

// =============================================================================
// File names and layout
// =============================================================================

/// Last-applied clustering script per scale factor
pub const LAST_CLUSTER_FILE: &str = "last_cluster.json";

/// Last-applied index set per scale factor
pub const LAST_INDEXES_FILE: &str = "last_indexes.json";

/// Experiment-level configuration written at the top of each results directory
pub const TRIAL_CONFIG_FILE: &str = "test_config.json";

/// Before/after block-device counters written next to the load-generator output
pub const IOSTATS_FILE: &str = "iostats.json";

/// Load-generator artifacts inside a per-variant results subdirectory
pub const SUMMARY_FILE: &str = "summary.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const STREAM_TIMES_FILE: &str = "stream_times.json";

/// Prefix of timestamped results directories
pub const RESULTS_DIR_PREFIX: &str = "TPCH";

/// Relation whose hit rate is reported on its own
pub const LARGE_RELATION: &str = "lineitem";

/// Sample BenchBase database name prefix; the scale factor is appended
pub const DATABASE_PREFIX: &str = "TPCH_";

/// Buffer-manager sources touched after a pull so `make` rebuilds them,
/// relative to the source tree of every non-base branch
pub const PBM_SOURCE_FILES: &[&str] = &[
    "src/include/storage/pbm.h",
    "src/backend/storage/buffer/pbm.c",
    "src/backend/storage/buffer/pbm_internal.c",
    "src/backend/storage/buffer/freelist.c",
    "src/backend/storage/buffer/bufmgr.c",
];

/// Tables whose autovacuum is suspended while the load generator bulk-loads
pub const BULK_LOADED_TABLES: &[&str] = &["lineitem", "orders", "partsupp"];

/// BenchBase build artifact unpacked into the install directory
pub const BENCHBASE_ARCHIVE: &str = "target/benchbase-postgres.tgz";

// =============================================================================
// Statistics
// =============================================================================

/// z value for a two-sided 95% normal confidence interval
pub const Z_95: f64 = 1.96;

/// KiB per GiB; block counts times block size (KiB) divided by this gives GiB
pub const KIB_PER_GIB: f64 = (1u64 << 20) as f64;

/// Stream completion times are reported in microseconds
pub const MICROS_PER_SEC: f64 = 1_000_000.0;
