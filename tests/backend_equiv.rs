//! The two backends must produce identical result sets for identical
//! parameters. GPU cases skip (with a note) on machines without a compute
//! adapter.

use ringscan::{
    run_search, Backend, Cluster, CollectingSink, CountStrategy, GpuContext, GpuSearcher,
    SearchParams,
};

fn collect(params: &SearchParams, backend: Backend) -> Vec<Cluster> {
    let workers = match backend {
        Backend::Cpu { workers } => workers.max(1),
        Backend::Gpu { .. } => 1,
    };
    let sink = CollectingSink::new(workers);
    run_search(params, backend, &sink).expect("search failed");
    let mut clusters = sink.into_clusters();
    clusters.sort_by_key(|c| (c.x, c.z, c.count));
    clusters
}

fn gpu_available() -> bool {
    match GpuContext::new_headless() {
        Ok(_) => true,
        Err(err) => {
            eprintln!("skipping gpu test: {err}");
            false
        }
    }
}

#[test]
fn cpu_worker_counts_agree() {
    let params = SearchParams {
        seed: -4_200_321,
        range: 48,
        threshold: 3,
        outer_radius: 4,
        inner_radius: 1,
    };
    let baseline = collect(&params, Backend::Cpu { workers: 1 });
    assert!(!baseline.is_empty(), "test wants a non-trivial result set");
    for workers in [2, 7, 16] {
        assert_eq!(baseline, collect(&params, Backend::Cpu { workers }));
    }
}

#[test]
fn gpu_matches_cpu_with_device_filtering() {
    if !gpu_available() {
        return;
    }
    for seed in [0i64, 1, -77_000_000_000] {
        let params = SearchParams {
            seed,
            range: 40,
            threshold: 2,
            outer_radius: 5,
            inner_radius: 2,
        };
        let cpu = collect(&params, Backend::Cpu { workers: 4 });
        let gpu = collect(
            &params,
            Backend::Gpu {
                strategy: CountStrategy::DeviceFilter,
            },
        );
        assert_eq!(cpu, gpu, "seed {seed}");
    }
}

#[test]
fn gpu_matches_cpu_with_host_filtering() {
    if !gpu_available() {
        return;
    }
    let params = SearchParams {
        seed: 987_654_321,
        range: 40,
        threshold: -1,
        outer_radius: 3,
        inner_radius: 0,
    };
    let cpu = collect(&params, Backend::Cpu { workers: 2 });
    let gpu = collect(
        &params,
        Backend::Gpu {
            strategy: CountStrategy::HostFilter,
        },
    );
    assert_eq!(cpu, gpu);
}

#[test]
fn gpu_strategies_agree_with_each_other() {
    if !gpu_available() {
        return;
    }
    let params = SearchParams {
        seed: 31_415,
        range: 32,
        threshold: 4,
        outer_radius: 6,
        inner_radius: 1,
    };
    let filtered = collect(
        &params,
        Backend::Gpu {
            strategy: CountStrategy::DeviceFilter,
        },
    );
    let dense = collect(
        &params,
        Backend::Gpu {
            strategy: CountStrategy::HostFilter,
        },
    );
    assert_eq!(filtered, dense);
}

#[test]
fn gpu_rejects_oversized_masks() {
    if !gpu_available() {
        return;
    }
    let ctx = GpuContext::new_headless().expect("adapter probed above");
    let searcher = GpuSearcher::new(ctx, CountStrategy::DeviceFilter).expect("kernel build");
    let params = SearchParams {
        seed: 1,
        range: 4,
        threshold: 1,
        outer_radius: 600,
        inner_radius: 0,
    };
    let sink = CollectingSink::new(1);
    let err = searcher.search(&params, &sink).unwrap_err();
    assert!(
        matches!(err, ringscan::SearchError::MaskTooLarge { .. }),
        "unexpected error {err}"
    );
}
