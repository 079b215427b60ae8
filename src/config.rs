//! Configuration types used to initialize a [`PipeGraph`](crate::PipeGraph).

use std::env;
use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Environment variable with the directory where the statistics files are
/// written. When unset, `./log` is used.
pub const LOG_DIR_ENV_VAR: &str = "WF_LOG_DIR";
/// Environment variable overriding the number of envelopes an emitter
/// inspects between two punctuation-generation checks.
pub const WM_AMOUNT_ENV_VAR: &str = "WF_DEFAULT_WM_AMOUNT";
/// Environment variable overriding the minimum wall-clock distance, in
/// microseconds, between two generated punctuations.
pub const WM_INTERVAL_ENV_VAR: &str = "WF_DEFAULT_WM_INTERVAL_USEC";

const DEFAULT_WM_AMOUNT: u64 = 256;
const DEFAULT_WM_INTERVAL_USEC: u64 = 1000;

/// Input-consumption discipline of the replicas.
///
/// The mode is a property of the whole graph and is fixed before any
/// operator is added.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExecutionMode {
    /// Best effort: each replica consumes its inputs FIFO, with no ordering
    /// across channels. Highest throughput.
    #[default]
    Default,
    /// Each replica merges its input channels in non-decreasing
    /// `(timestamp, channel)` order. Two runs over the same sources produce
    /// identical sequences at every sink.
    Deterministic,
    /// Like [`ExecutionMode::Deterministic`], but a lagging channel is
    /// waited for only up to a configured timestamp slack. Occasional
    /// out-of-order deliveries are traded for lower latency.
    Probabilistic,
}

/// How tuple timestamps are assigned at the sources.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TimePolicy {
    /// Timestamps and watermarks are set explicitly by the source logic.
    #[default]
    EventTime,
    /// Tuples are stamped with the runtime clock when they enter the graph;
    /// watermarks advance with the clock.
    IngressTime,
}

/// Runtime configuration of a graph.
///
/// ## Example
///
/// ```
/// use sirocco::{GraphConfig, ExecutionMode, PipeGraph};
///
/// let config = GraphConfig::default()
///     .execution_mode(ExecutionMode::Deterministic)
///     .collect_statistics(true);
/// let graph = PipeGraph::with_config("wordcount", config);
/// ```
#[derive(Clone, Debug)]
pub struct GraphConfig {
    pub(crate) execution_mode: ExecutionMode,
    pub(crate) time_policy: TimePolicy,
    pub(crate) statistics: bool,
    pub(crate) probabilistic_slack: u64,
    pub(crate) log_dir: Option<PathBuf>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            execution_mode: ExecutionMode::default(),
            time_policy: TimePolicy::default(),
            statistics: false,
            probabilistic_slack: 1000,
            log_dir: None,
        }
    }
}

impl GraphConfig {
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn time_policy(mut self, policy: TimePolicy) -> Self {
        self.time_policy = policy;
        self
    }

    /// Collect per-replica statistics and dump one JSON file per operator
    /// when the graph terminates.
    pub fn collect_statistics(mut self, enabled: bool) -> Self {
        self.statistics = enabled;
        self
    }

    /// Timestamp slack, in microseconds, tolerated by
    /// [`ExecutionMode::Probabilistic`] before an input channel is no longer
    /// waited for.
    pub fn probabilistic_slack(mut self, slack_usec: u64) -> Self {
        self.probabilistic_slack = slack_usec;
        self
    }

    /// Directory for the statistics files, overriding `WF_LOG_DIR`.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub(crate) fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .or_else(|| env::var_os(LOG_DIR_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./log"))
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(
                "invalid value for {}: {:?}, using default {}",
                name, raw, default
            );
            default
        }),
        Err(_) => default,
    }
}

/// Envelopes between two punctuation-generation checks. Read once per
/// process.
pub(crate) fn wm_amount() -> u64 {
    static AMOUNT: Lazy<u64> = Lazy::new(|| env_u64(WM_AMOUNT_ENV_VAR, DEFAULT_WM_AMOUNT));
    *AMOUNT
}

/// Minimum microseconds between two generated punctuations. Read once per
/// process.
pub(crate) fn wm_interval_usec() -> u64 {
    static INTERVAL: Lazy<u64> =
        Lazy::new(|| env_u64(WM_INTERVAL_ENV_VAR, DEFAULT_WM_INTERVAL_USEC));
    *INTERVAL
}
