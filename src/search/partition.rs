//! Strip partitioning and the worker fan-out for the host backend.

use std::thread;

use crate::error::SearchError;
use crate::geometry::AnnulusMask;
use crate::search::{ClusterSink, SearchParams, WorkerId};

/// Half-open column range `[start_x, end_x)` assigned to one worker. Every
/// strip keeps the full z span of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strip {
    pub start_x: i32,
    pub end_x: i32,
}

impl Strip {
    pub fn width(&self) -> i32 {
        self.end_x - self.start_x
    }
}

/// Split the x span `[-range, range)` into `workers` contiguous strips.
///
/// Integer division leaves a remainder of fewer than `workers` columns;
/// the first strip absorbs all of it, so every later strip has equal
/// width. The strips are disjoint and cover the span exactly.
pub fn partition(range: i32, workers: usize) -> Vec<Strip> {
    debug_assert!(range > 0 && workers > 0);
    let span = 2 * range;
    let step = span / workers as i32;
    let remainder = span % workers as i32;

    let mut strips = Vec::with_capacity(workers);
    let mut x = -range;
    for i in 0..workers {
        let mut end = x + step;
        if i == 0 {
            end += remainder;
        }
        strips.push(Strip { start_x: x, end_x: end });
        x = end;
    }
    strips
}

/// Run one scan worker per strip and join them all.
///
/// A strip whose worker cannot be spawned is recorded as a failure, but
/// workers that did start are always joined, and whatever they already
/// delivered to the sink stands. The first spawn failure or worker panic
/// is reported after the join barrier; completed output is never rolled
/// back.
pub(super) fn run_striped(
    params: &SearchParams,
    mask: &AnnulusMask,
    strips: &[Strip],
    sink: &dyn ClusterSink,
) -> Result<(), SearchError> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(strips.len());
        let mut spawn_error = None;

        for (worker, strip) in strips.iter().enumerate() {
            let builder = thread::Builder::new().name(format!("scan-{worker}"));
            let spawned = builder.spawn_scoped(scope, move || {
                super::cpu::scan_strip(params, mask, *strip, WorkerId(worker), sink);
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    log::warn!("worker {worker} failed to start: {err}");
                    if spawn_error.is_none() {
                        spawn_error = Some(SearchError::WorkerSpawn(err));
                    }
                }
            }
        }

        let mut panic_error = None;
        for handle in handles {
            if handle.join().is_err() && panic_error.is_none() {
                panic_error = Some(SearchError::WorkerPanic);
            }
        }

        match spawn_error.or(panic_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_cover_the_span_exactly() {
        for range in [1, 7, 100, 128] {
            for workers in [1, 2, 3, 5, 8, 13] {
                let strips = partition(range, workers);
                assert_eq!(strips.len(), workers);
                assert_eq!(strips[0].start_x, -range);
                assert_eq!(strips.last().unwrap().end_x, range);
                for pair in strips.windows(2) {
                    assert_eq!(pair[0].end_x, pair[1].start_x, "gap or overlap");
                }
            }
        }
    }

    #[test]
    fn first_strip_absorbs_the_remainder() {
        // Span 20 over 3 workers: 6 each plus a remainder of 2 up front.
        let strips = partition(10, 3);
        assert_eq!(strips[0].width(), 8);
        assert_eq!(strips[1].width(), 6);
        assert_eq!(strips[2].width(), 6);
    }

    #[test]
    fn scanned_columns_reconstruct_without_gaps() {
        let range = 37;
        let strips = partition(range, 5);
        let mut seen = vec![0u8; (2 * range) as usize];
        for strip in &strips {
            for x in strip.start_x..strip.end_x {
                seen[(x + range) as usize] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "duplicate or missing column");
    }

    #[test]
    fn more_workers_than_columns_yields_empty_tail_strips() {
        let strips = partition(1, 4);
        assert_eq!(strips[0].width(), 2);
        assert!(strips[1..].iter().all(|s| s.width() == 0));
    }
}
