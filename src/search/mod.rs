//! Search parameters, results, and the backend-independent entry point.
//!
//! Both backends consume the same immutable [`SearchParams`] and stream
//! matches into a [`ClusterSink`]; which hardware does the counting is an
//! execution detail selected through [`Backend`].

mod cpu;
mod partition;

pub use cpu::CpuSearcher;
pub use partition::{partition, Strip};

use serde::Serialize;
use std::sync::Mutex;

use crate::error::SearchError;
use crate::gpu::{CountStrategy, GpuContext, GpuSearcher};

/// Immutable description of one search, shared read-only by all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    /// Seed of the boolean field.
    pub seed: i64,
    /// Half-width of the search square; both axes cover `[-range, range)`.
    pub range: i32,
    /// Signed match threshold. Positive reports counts `>= threshold`,
    /// negative reports counts `<= -threshold`. Zero is rejected because
    /// the sign carries the direction.
    pub threshold: i32,
    /// Outer radius of the annulus, in cells.
    pub outer_radius: i32,
    /// Inner exclusion radius. Larger than `outer_radius` degrades to an
    /// always-empty annulus rather than an error.
    pub inner_radius: i32,
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.range <= 0 {
            return Err(SearchError::InvalidRange(self.range));
        }
        if self.threshold == 0 {
            return Err(SearchError::ZeroThreshold);
        }
        if self.outer_radius < 0 || self.inner_radius < 0 {
            return Err(SearchError::NegativeRadius {
                outer: self.outer_radius,
                inner: self.inner_radius,
            });
        }
        Ok(())
    }

    /// Width of the search square in cells, `2 * range`.
    pub fn span(&self) -> i32 {
        2 * self.range
    }

    /// Apply the signed threshold convention to an annulus count.
    pub fn matches(&self, count: u32) -> bool {
        if self.threshold < 0 {
            count as i32 <= -self.threshold
        } else {
            count as i32 >= self.threshold
        }
    }
}

/// A reported cell: its position and the annulus count that crossed the
/// threshold. Produced at the moment of the match and handed straight to
/// the sink; the engine keeps no result history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub x: i32,
    pub z: i32,
    pub count: u32,
}

impl Cluster {
    /// Total order used by callers that sort output: best count first
    /// (direction given by the threshold sign), then nearer the origin,
    /// then coordinates as the final tiebreak.
    pub fn order_before(&self, other: &Cluster, threshold: i32) -> bool {
        if self.count != other.count {
            return if threshold < 0 {
                self.count < other.count
            } else {
                self.count > other.count
            };
        }
        let a = self.x as i64 * self.x as i64 + self.z as i64 * self.z as i64;
        let b = other.x as i64 * other.x as i64 + other.z as i64 * other.z as i64;
        if a != b {
            return a < b;
        }
        if self.x != other.x {
            return self.x < other.x;
        }
        self.z < other.z
    }
}

/// Identifies the worker that produced a cluster: the strip index on the
/// CPU backend, always 0 on the GPU backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId(pub usize);

/// Consumer of search results.
///
/// The CPU backend invokes `on_cluster` concurrently from its worker
/// threads, so implementations must be `Sync`; the worker id lets a sink
/// demultiplex into per-worker storage instead of serializing every call.
/// The GPU backend delivers all clusters from the host thread.
pub trait ClusterSink: Sync {
    fn on_cluster(&self, cluster: Cluster, worker: WorkerId);
}

/// Sink that collects into one buffer per worker, deferring the merge to
/// the end of the search so workers never contend on a shared lock.
pub struct CollectingSink {
    buffers: Vec<Mutex<Vec<Cluster>>>,
}

impl CollectingSink {
    /// `workers` must be at least the number of distinct worker ids the
    /// backend will report: the CPU worker count, or 1 for the GPU.
    pub fn new(workers: usize) -> Self {
        CollectingSink {
            buffers: (0..workers.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Merge the per-worker buffers, in worker order.
    pub fn into_clusters(self) -> Vec<Cluster> {
        self.buffers
            .into_iter()
            .flat_map(|buf| buf.into_inner().unwrap_or_default())
            .collect()
    }
}

impl ClusterSink for CollectingSink {
    fn on_cluster(&self, cluster: Cluster, worker: WorkerId) {
        if let Ok(mut buf) = self.buffers[worker.0].lock() {
            buf.push(cluster);
        }
    }
}

/// Backend selector for [`run_search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Host threads, one column strip per worker. `workers == 0` selects
    /// the available hardware parallelism.
    Cpu { workers: usize },
    /// Tiled compute dispatch on a freshly acquired headless device.
    Gpu { strategy: CountStrategy },
}

/// Run a search on the chosen backend, streaming matches into `sink`.
///
/// Returns once every worker (or tile) has completed. Cross-worker result
/// order is unspecified; within one worker, z increases before x.
pub fn run_search(
    params: &SearchParams,
    backend: Backend,
    sink: &dyn ClusterSink,
) -> Result<(), SearchError> {
    match backend {
        Backend::Cpu { workers } => CpuSearcher::new(workers).search(params, sink),
        Backend::Gpu { strategy } => {
            let ctx = GpuContext::new_headless()?;
            GpuSearcher::new(ctx, strategy)?.search(params, sink)
        }
    }
}
