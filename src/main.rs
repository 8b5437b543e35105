use std::cmp::Ordering;

use clap::{Parser, ValueEnum};

use ringscan::util::ScopeTimer;
use ringscan::{
    run_search, Backend, Cluster, CollectingSink, CountStrategy, CpuSearcher, SearchParams,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Method {
    Cpu,
    Gpu,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GpuStrategy {
    /// Threshold tested on-device, matches appended atomically.
    #[value(name = "device-filter")]
    DeviceFilter,
    /// Per-cell counts read back, threshold tested on the host.
    #[value(name = "host-filter")]
    HostFilter,
}

impl From<GpuStrategy> for CountStrategy {
    fn from(value: GpuStrategy) -> Self {
        match value {
            GpuStrategy::DeviceFilter => CountStrategy::DeviceFilter,
            GpuStrategy::HostFilter => CountStrategy::HostFilter,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Human,
    Csv,
    Json,
}

/// Search a seeded pseudorandom grid for dense annular clusters.
#[derive(Parser, Debug)]
#[command(name = "ringscan", version, about)]
struct Cli {
    /// Seed of the field
    #[arg(allow_negative_numbers = true)]
    seed: i64,

    /// Half-width of the search square; both axes cover [-range, range)
    range: i32,

    /// Match threshold: positive reports counts >= t, negative counts <= -t
    #[arg(allow_negative_numbers = true)]
    threshold: i32,

    /// Search backend
    #[arg(short, long, value_enum, default_value_t = Method::Cpu)]
    method: Method,

    /// Result delivery strategy (gpu only)
    #[arg(long, value_enum, default_value_t = GpuStrategy::DeviceFilter)]
    gpu_strategy: GpuStrategy,

    /// Worker threads (cpu only, 0 = all hardware threads)
    #[arg(short = 'j', long, default_value_t = 0)]
    threads: usize,

    /// Outer radius of the annulus
    #[arg(long, default_value_t = 8)]
    outer_radius: i32,

    /// Inner exclusion radius of the annulus
    #[arg(long, default_value_t = 1)]
    inner_radius: i32,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Human)]
    format: Format,
}

fn print_human(clusters: &[Cluster]) {
    match clusters.len() {
        0 => println!("No results"),
        1 => println!("1 result:"),
        n => println!("{n} results:"),
    }
    for c in clusters {
        println!("({:6}, {:6}) {:3} cells", c.x, c.z, c.count);
    }
}

fn print_csv(clusters: &[Cluster]) {
    println!("x,z,count");
    for c in clusters {
        println!("{},{},{}", c.x, c.z, c.count);
    }
}

fn print_json(clusters: &[Cluster]) {
    match serde_json::to_string(clusters) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to encode results: {err}"),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let params = SearchParams {
        seed: cli.seed,
        range: cli.range,
        threshold: cli.threshold,
        outer_radius: cli.outer_radius,
        inner_radius: cli.inner_radius,
    };

    let (backend, workers) = match cli.method {
        Method::Cpu => {
            let searcher = CpuSearcher::new(cli.threads);
            let workers = searcher.workers();
            (Backend::Cpu { workers }, workers)
        }
        Method::Gpu => (
            Backend::Gpu {
                strategy: cli.gpu_strategy.into(),
            },
            1,
        ),
    };

    let sink = CollectingSink::new(workers);
    let outcome = {
        let _t = ScopeTimer::new("search");
        run_search(&params, backend, &sink)
    };

    // A failed search may still have delivered partial output from the
    // workers that completed; print what there is, then report the error.
    let mut clusters = sink.into_clusters();
    clusters.sort_by(|a, b| {
        if a.order_before(b, params.threshold) {
            Ordering::Less
        } else if b.order_before(a, params.threshold) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });

    match cli.format {
        Format::Human => print_human(&clusters),
        Format::Csv => print_csv(&clusters),
        Format::Json => print_json(&clusters),
    }

    if let Err(err) = outcome {
        eprintln!("search failed: {err}");
        std::process::exit(2);
    }
}
