//! Per-replica statistics records, aggregated by the main thread after the
//! graph terminates.
//!
//! Every record is written only by its owning worker thread and pushed into
//! the operator's shared slot when the replica exits; there is no mutable
//! state shared between running replicas.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Service-time accounting, sampled every [`SAMPLE_EVERY`] input envelopes.
const SAMPLE_EVERY: u64 = 64;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServiceTime {
    pub samples: u64,
    pub total_usec: u64,
    pub max_usec: u64,
    pub avg_usec: f64,
}

/// Counters of a single replica.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplicaStats {
    pub replica_id: usize,
    pub inputs_received: u64,
    pub outputs_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub ignored_tuples: u64,
    pub service_time: ServiceTime,
}

/// Statistics of one operator, shaped for the JSON dump.
#[derive(Clone, Debug, Serialize)]
pub struct OperatorStats {
    #[serde(rename = "Operator_name")]
    pub name: String,
    #[serde(rename = "Operator_type")]
    pub op_type: String,
    #[serde(rename = "Distribution")]
    pub distribution: String,
    #[serde(rename = "isTerminated")]
    pub is_terminated: bool,
    #[serde(rename = "isWindowed")]
    pub is_windowed: bool,
    #[serde(rename = "Window_type")]
    pub window_type: Option<String>,
    #[serde(rename = "Window_length")]
    pub window_length: Option<u64>,
    #[serde(rename = "Window_slide")]
    pub window_slide: Option<u64>,
    #[serde(rename = "Parallelism")]
    pub parallelism: usize,
    #[serde(rename = "OutputBatchSize")]
    pub output_batch_size: usize,
    #[serde(rename = "Replicas")]
    pub replicas: Vec<ReplicaStats>,
}

impl OperatorStats {
    pub fn inputs(&self) -> u64 {
        self.replicas.iter().map(|r| r.inputs_received).sum()
    }

    pub fn outputs(&self) -> u64 {
        self.replicas.iter().map(|r| r.outputs_sent).sum()
    }

    pub fn ignored_tuples(&self) -> u64 {
        self.replicas.iter().map(|r| r.ignored_tuples).sum()
    }
}

/// Snapshot of the whole graph, returned by
/// [`PipeGraph::run`](crate::PipeGraph::run).
#[derive(Debug, Default)]
pub struct GraphSummary {
    operators: Vec<OperatorStats>,
    by_name: HashMap<String, usize, fxhash::FxBuildHasher>,
}

impl GraphSummary {
    pub(crate) fn new(operators: Vec<OperatorStats>) -> Self {
        let by_name = operators
            .iter()
            .enumerate()
            .map(|(idx, op)| (op.name.clone(), idx))
            .collect();
        GraphSummary { operators, by_name }
    }

    pub fn operators(&self) -> &[OperatorStats] {
        &self.operators
    }

    pub fn operator(&self, name: &str) -> Option<&OperatorStats> {
        self.by_name.get(name).map(|&idx| &self.operators[idx])
    }

    /// Write one `{pid}_{operator}.json` file per operator into `dir`.
    pub(crate) fn dump(&self, dir: &Path) {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("cannot create statistics directory {:?}: {}", dir, e);
            return;
        }
        let pid = std::process::id();
        for op in &self.operators {
            let path = dir.join(format!("{}_{}.json", pid, op.name));
            let res = fs::File::create(&path).and_then(|mut f| {
                serde_json::to_writer_pretty(&mut f, op)?;
                writeln!(f)
            });
            if let Err(e) = res {
                error!("cannot write statistics file {:?}: {}", path, e);
            }
        }
    }
}

/// Handle carried by a worker thread; pushes the finished record into the
/// operator's shared slot on exit.
pub(crate) struct StatsCollector {
    record: ReplicaStats,
    sink: Arc<Mutex<Vec<ReplicaStats>>>,
    countdown: u64,
}

impl StatsCollector {
    pub fn new(replica_id: usize, sink: Arc<Mutex<Vec<ReplicaStats>>>) -> Self {
        StatsCollector {
            record: ReplicaStats {
                replica_id,
                ..ReplicaStats::default()
            },
            sink,
            countdown: 1,
        }
    }

    /// Start a service-time sample once every [`SAMPLE_EVERY`] envelopes.
    pub fn probe(&mut self) -> Option<Instant> {
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = SAMPLE_EVERY;
            Some(Instant::now())
        } else {
            None
        }
    }

    pub fn commit(&mut self, probe: Option<Instant>) {
        if let Some(start) = probe {
            let usec = start.elapsed().as_micros() as u64;
            let st = &mut self.record.service_time;
            st.samples += 1;
            st.total_usec += usec;
            st.max_usec = st.max_usec.max(usec);
        }
    }

    pub fn tuple_in<I>(&mut self) {
        self.record.inputs_received += 1;
        self.record.bytes_received += std::mem::size_of::<I>() as u64;
    }

    pub fn tuples_out<O>(&mut self, sent: u64, ignored: u64) {
        self.record.outputs_sent = sent;
        self.record.bytes_sent = sent * std::mem::size_of::<O>() as u64;
        self.record.ignored_tuples = ignored;
    }

    pub fn finish(mut self) {
        let st = &mut self.record.service_time;
        if st.samples > 0 {
            st.avg_usec = st.total_usec as f64 / st.samples as f64;
        }
        self.sink.lock().push(self.record);
    }
}
