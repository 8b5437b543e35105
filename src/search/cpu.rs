//! Ring-buffered sliding-window scanner (host backend).
//!
//! Each worker walks its column strip left to right and scans every column
//! top to bottom, keeping the predicate results for the annulus bounding
//! box in a circular row cache. Advancing one cell down evaluates exactly
//! one new row of predicates; the count itself only touches the cells the
//! mask's width table names, so a cell costs O(outer_radius) amortized
//! instead of O(outer_radius^2).

use std::num::NonZeroUsize;

use crate::error::SearchError;
use crate::field::Field;
use crate::geometry::AnnulusMask;
use crate::search::partition::{partition, run_striped, Strip};
use crate::search::{Cluster, ClusterSink, SearchParams, WorkerId};
use crate::util::ScopeTimer;

/// Circular cache of predicate rows covering the annulus bounding box
/// around the current scan position.
///
/// Capacity is the bounding-box side rounded up to a power of two, so
/// wrapping an index is a mask. The newest row always corresponds to the
/// bottom of the window, `cz = +outer_radius`.
struct RowRing {
    cells: Vec<bool>,
    side: usize,
    radius: i32,
    wrap: i32,
    head: i32,
}

impl RowRing {
    fn new(outer_radius: i32) -> Self {
        let side = (2 * outer_radius + 1) as usize;
        let capacity = side.next_power_of_two();
        RowRing {
            cells: vec![false; capacity * side],
            side,
            radius: outer_radius,
            wrap: capacity as i32 - 1,
            head: 0,
        }
    }

    /// Evaluate the predicate row at `z` for columns `x - r ..= x + r` and
    /// make it the newest row of the window.
    fn push_row(&mut self, field: &Field, x: i32, z: i32) {
        self.head = (self.head + 1) & self.wrap;
        let base = self.head as usize * self.side;
        for k in -self.radius..=self.radius {
            self.cells[base + (k + self.radius) as usize] = field.is_positive(x + k, z);
        }
    }

    /// Cached value at row offset `cz` and column offset `cx`, both
    /// relative to the window center.
    fn get(&self, cz: i32, cx: i32) -> bool {
        let row = (self.head - self.radius + cz) & self.wrap;
        self.cells[row as usize * self.side + (cx + self.radius) as usize]
    }
}

/// Scan every column of `strip`, z increasing, reporting cells whose
/// annulus count crosses the threshold.
pub(super) fn scan_strip(
    params: &SearchParams,
    mask: &AnnulusMask,
    strip: Strip,
    worker: WorkerId,
    sink: &dyn ClusterSink,
) {
    let r = params.outer_radius;
    let field = Field::new(params.seed);
    let mut ring = RowRing::new(r);
    let (start_z, end_z) = (-params.range, params.range);

    for x in strip.start_x..strip.end_x {
        // Warm the window: every row above the first scan position. The
        // row at start_z + r is pushed by the first loop step below.
        for z in start_z - r..start_z + r {
            ring.push_row(&field, x, z);
        }

        for z in start_z..end_z {
            ring.push_row(&field, x, z + r);

            let mut count = 0u32;
            for cz in -r..=r {
                let span = mask.row(cz);
                for cx in span.inner..=span.outer {
                    count += ring.get(cz, cx) as u32;
                    if cx != 0 {
                        count += ring.get(cz, -cx) as u32;
                    }
                }
            }

            if params.matches(count) {
                sink.on_cluster(Cluster { x, z, count }, worker);
            }
        }
    }
}

/// Multi-threaded host backend: one scan worker per column strip.
///
/// Workers share nothing mutable; the parameters and mask are read-only
/// and each worker owns its row cache exclusively.
pub struct CpuSearcher {
    workers: usize,
}

impl CpuSearcher {
    /// `workers == 0` selects the available hardware parallelism.
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            workers
        };
        CpuSearcher { workers }
    }

    /// Resolved worker count; sinks that demultiplex per worker can size
    /// their buffers from this.
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn search(
        &self,
        params: &SearchParams,
        sink: &dyn ClusterSink,
    ) -> Result<(), SearchError> {
        params.validate()?;
        let _t = ScopeTimer::new("cpu search");

        let mask = AnnulusMask::new(params.outer_radius, params.inner_radius);
        // More workers than columns would only spawn idle threads.
        let workers = self.workers.min(params.span() as usize).max(1);
        let strips = partition(params.range, workers);
        log::info!(
            "cpu search: seed {}, span {}x{}, {} workers",
            params.seed,
            params.span(),
            params.span(),
            workers
        );
        run_striped(params, &mask, &strips, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::CollectingSink;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Count the annulus directly from the field, one predicate call per
    /// member cell.
    fn brute_force_count(field: &Field, mask: &AnnulusMask, x: i32, z: i32) -> u32 {
        let r = mask.outer_radius();
        let mut count = 0;
        for cz in -r..=r {
            for cx in -r..=r {
                if mask.contains(cx, cz) && field.is_positive(x + cx, z + cz) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Scan with a threshold loose enough to report every cell, returning
    /// (position, count) for the full square.
    fn all_counts(params: &SearchParams, workers: usize) -> Vec<Cluster> {
        let loose = SearchParams {
            threshold: -1_000_000,
            ..*params
        };
        let sink = CollectingSink::new(workers);
        CpuSearcher::new(workers).search(&loose, &sink).unwrap();
        let mut clusters = sink.into_clusters();
        clusters.sort_by_key(|c| (c.x, c.z));
        clusters
    }

    #[test]
    fn window_counts_match_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..4 {
            let params = SearchParams {
                seed: rng.gen(),
                range: 8,
                threshold: 1,
                outer_radius: rng.gen_range(0..5),
                inner_radius: rng.gen_range(0..4),
            };
            let field = Field::new(params.seed);
            let mask = AnnulusMask::new(params.outer_radius, params.inner_radius);

            let clusters = all_counts(&params, 1);
            assert_eq!(clusters.len(), (params.span() * params.span()) as usize);
            for c in &clusters {
                let expected = brute_force_count(&field, &mask, c.x, c.z);
                assert_eq!(
                    c.count, expected,
                    "count mismatch at ({}, {}) for {params:?}",
                    c.x, c.z
                );
            }
        }
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let params = SearchParams {
            seed: 1234,
            range: 16,
            threshold: 2,
            outer_radius: 3,
            inner_radius: 1,
        };
        let single = all_counts(&params, 1);
        for workers in [2, 3, 5, 64] {
            assert_eq!(single, all_counts(&params, workers), "{workers} workers");
        }
    }

    #[test]
    fn scan_covers_the_square_exactly_once() {
        let params = SearchParams {
            seed: 9,
            range: 6,
            threshold: 1,
            outer_radius: 2,
            inner_radius: 0,
        };
        let clusters = all_counts(&params, 3);
        let mut positions: Vec<(i32, i32)> = clusters.iter().map(|c| (c.x, c.z)).collect();
        positions.dedup();
        assert_eq!(positions.len(), 144);
        assert_eq!(positions.first(), Some(&(-6, -6)));
        assert_eq!(positions.last(), Some(&(5, 5)));
    }

    #[test]
    fn threshold_filters_in_both_directions() {
        let params = SearchParams {
            seed: 555,
            range: 10,
            threshold: 1,
            outer_radius: 3,
            inner_radius: 0,
        };
        let everything = all_counts(&params, 2);

        for threshold in [2, -2] {
            let filtered_params = SearchParams { threshold, ..params };
            let sink = CollectingSink::new(2);
            CpuSearcher::new(2).search(&filtered_params, &sink).unwrap();
            let mut got = sink.into_clusters();
            got.sort_by_key(|c| (c.x, c.z));

            let expected: Vec<Cluster> = everything
                .iter()
                .copied()
                .filter(|c| filtered_params.matches(c.count))
                .collect();
            assert_eq!(got, expected, "threshold {threshold}");
        }
    }

    #[test]
    fn single_cell_window_reports_the_predicate() {
        // Radius 0 means each cell's annulus is the cell itself, so the
        // matches at threshold 1 are exactly the positive cells of the
        // 2x2 square around the origin.
        let params = SearchParams {
            seed: 0,
            range: 1,
            threshold: 1,
            outer_radius: 0,
            inner_radius: 0,
        };
        let field = Field::new(0);
        let sink = CollectingSink::new(1);
        CpuSearcher::new(1).search(&params, &sink).unwrap();
        let mut got = sink.into_clusters();
        got.sort_by_key(|c| (c.x, c.z));

        let mut expected = Vec::new();
        for x in -1..1 {
            for z in -1..1 {
                if field.is_positive(x, z) {
                    expected.push(Cluster { x, z, count: 1 });
                }
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn empty_annulus_counts_zero_everywhere() {
        let params = SearchParams {
            seed: 77,
            range: 4,
            threshold: 1,
            outer_radius: 2,
            inner_radius: 5,
        };
        let clusters = all_counts(&params, 1);
        assert!(clusters.iter().all(|c| c.count == 0));

        // A positive threshold can never match; a loose negative one
        // matches every cell.
        let sink = CollectingSink::new(1);
        CpuSearcher::new(1).search(&params, &sink).unwrap();
        assert!(sink.into_clusters().is_empty());
    }

    #[test]
    fn row_ring_reflects_the_field() {
        let field = Field::new(31337);
        let r = 3;
        let mut ring = RowRing::new(r);
        let x = 5;
        // Push rows for z in [-3, 3]; the window center lands on z = 0.
        for z in -r..=r {
            ring.push_row(&field, x, z);
        }
        for cz in -r..=r {
            for cx in -r..=r {
                assert_eq!(ring.get(cz, cx), field.is_positive(x + cx, cz));
            }
        }
        // One more row slides the center to z = 1.
        ring.push_row(&field, x, r + 1);
        for cz in -r..=r {
            for cx in -r..=r {
                assert_eq!(ring.get(cz, cx), field.is_positive(x + cx, 1 + cz));
            }
        }
    }
}
