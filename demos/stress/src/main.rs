//! Drive a block cache from many threads and report what it did.
//!
//! Every worker repeatedly reads a random block from a shared working set, sometimes stamps it
//! with its own identity and an operation counter (writing it through), and releases it. When a
//! worker revisits a block it stamped, it checks that the block either carries another worker's
//! stamp or the last stamp it wrote itself. Once all workers finish, the cache metrics are printed
//! and the slot accounting is verified.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin bcache-stress -- --threads 8 --capacity 30 --blocks 100
//! ```
//!
//! Use `--storage-dir` to back the cache with image files instead of memory, and
//! `--block-on-exhaustion` to wait for free slots instead of retrying.

use bcache::{
    disk::{self, memory, metered, Disk},
    Cache, Config, Error, Exhaustion,
};
use clap::{value_parser, Arg, ArgAction, Command};
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    thread,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Bytes at the start of a block holding a stamp (worker, sequence).
const STAMP: usize = 16;

/// Outcome of a single worker.
#[derive(Default)]
struct Report {
    reads: u64,
    writes: u64,
    exhausted: u64,
    corrupt: u64,
}

fn main() {
    // Parse arguments
    let matches = Command::new("bcache-stress")
        .about("drive a block cache from many threads and verify what it returns")
        .arg(
            Arg::new("capacity")
                .long("capacity")
                .default_value("30")
                .value_parser(value_parser!(usize))
                .help("Number of cache slots"),
        )
        .arg(
            Arg::new("buckets")
                .long("buckets")
                .default_value("13")
                .value_parser(value_parser!(usize))
                .help("Number of hash buckets"),
        )
        .arg(
            Arg::new("block-size")
                .long("block-size")
                .default_value("1024")
                .value_parser(value_parser!(usize))
                .help("Size of every block in bytes"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .default_value("8")
                .value_parser(value_parser!(u64))
                .help("Number of worker threads"),
        )
        .arg(
            Arg::new("operations")
                .long("operations")
                .default_value("10000")
                .value_parser(value_parser!(u64))
                .help("Operations per thread"),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .default_value("100")
                .value_parser(value_parser!(u64))
                .help("Number of distinct blocks requested"),
        )
        .arg(
            Arg::new("writes")
                .long("writes")
                .default_value("20")
                .value_parser(value_parser!(u8).range(0..=100))
                .help("Percentage of operations that write the block"),
        )
        .arg(
            Arg::new("block-on-exhaustion")
                .long("block-on-exhaustion")
                .action(ArgAction::SetTrue)
                .help("Wait for a free slot instead of failing the lookup"),
        )
        .arg(
            Arg::new("storage-dir")
                .long("storage-dir")
                .required(false)
                .help("Directory holding device images (memory is used if omitted)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("One of trace, debug, info, warn, error"),
        )
        .get_matches();

    // Create logger
    let level = matches.get_one::<String>("log-level").unwrap();
    let level = tracing::Level::from_str(level).expect("Log level not well-formed");
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure cache
    let capacity = *matches.get_one::<usize>("capacity").unwrap();
    let buckets = *matches.get_one::<usize>("buckets").unwrap();
    let block_size = *matches.get_one::<usize>("block-size").unwrap();
    let cfg = Config {
        capacity: NonZeroUsize::new(capacity).expect("Capacity must be positive"),
        buckets: NonZeroUsize::new(buckets).expect("Buckets must be positive"),
        block_size: NonZeroUsize::new(block_size).expect("Block size must be positive"),
        exhaustion: if matches.get_flag("block-on-exhaustion") {
            Exhaustion::Block
        } else {
            Exhaustion::Fail
        },
    };
    if cfg.block_size.get() < STAMP {
        panic!("Block size must be at least {STAMP} bytes");
    }

    // Configure workload
    let threads = *matches.get_one::<u64>("threads").unwrap();
    let operations = *matches.get_one::<u64>("operations").unwrap();
    let blocks = *matches.get_one::<u64>("blocks").unwrap();
    let writes = *matches.get_one::<u8>("writes").unwrap();
    if blocks == 0 {
        panic!("Please provide at least one block");
    }
    info!(
        capacity,
        buckets, block_size, threads, operations, blocks, writes, "configured workload"
    );

    // Run against the selected disk
    let mut registry = Registry::default();
    match matches.get_one::<String>("storage-dir") {
        Some(directory) => {
            let disk_cfg = disk::file::Config::new(PathBuf::from(directory), cfg.block_size, blocks);
            let disk = disk::file::Disk::open(disk_cfg).expect("Unable to open storage directory");
            info!(directory = %directory, "using file-backed disk");
            run(disk, cfg, &mut registry, threads, operations, blocks, writes);
        }
        None => {
            info!("using in-memory disk");
            let disk = memory::Disk::new(cfg.block_size);
            run(disk, cfg, &mut registry, threads, operations, blocks, writes);
        }
    }

    // Print metrics
    let mut buffer = String::new();
    encode(&mut buffer, &registry).expect("Unable to encode metrics");
    println!("{buffer}");
}

fn run<D: Disk>(
    disk: D,
    cfg: Config,
    registry: &mut Registry,
    threads: u64,
    operations: u64,
    blocks: u64,
    writes: u8,
) {
    let disk = metered::Disk::new(disk, registry.sub_registry_with_prefix("disk"));
    let cache = Cache::new(disk, cfg, registry.sub_registry_with_prefix("cache"))
        .expect("Unable to create cache");

    let start = Instant::now();
    let reports: Vec<Report> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|worker| {
                let cache = &cache;
                s.spawn(move || work(cache, worker, operations, blocks, writes))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect()
    });
    let elapsed = start.elapsed();

    // Summarize
    let total = reports.iter().fold(Report::default(), |mut total, report| {
        total.reads += report.reads;
        total.writes += report.writes;
        total.exhausted += report.exhausted;
        total.corrupt += report.corrupt;
        total
    });
    info!(
        reads = total.reads,
        writes = total.writes,
        exhausted = total.exhausted,
        disk_reads = cache.disk().reads(),
        disk_writes = cache.disk().writes(),
        ?elapsed,
        "workload complete"
    );

    // Every slot is back on the free list
    cache.dump();
    let snapshot = cache.snapshot();
    if snapshot.active() != 0 || snapshot.free.len() != cache.capacity() {
        error!(%snapshot, "slots not conserved");
        panic!("slots not conserved");
    }
    if total.corrupt > 0 {
        error!(corrupt = total.corrupt, "workers observed corrupt blocks");
        panic!("workers observed corrupt blocks");
    }
}

fn work<D: Disk>(
    cache: &Cache<D>,
    worker: u64,
    operations: u64,
    blocks: u64,
    writes: u8,
) -> Report {
    let mut rng = StdRng::seed_from_u64(worker);
    let mut stamped = HashMap::new();
    let mut report = Report::default();
    for sequence in 1..=operations {
        let block = rng.gen_range(0..blocks);
        let mut buf = match cache.read(0, block) {
            Ok(buf) => buf,
            Err(Error::Exhausted) => {
                report.exhausted += 1;
                thread::yield_now();
                continue;
            }
            Err(err) => panic!("read failed: {err}"),
        };
        report.reads += 1;

        // Our last stamp survives unless another worker overwrote it
        let owner = u64::from_le_bytes(buf[..8].try_into().unwrap());
        let seen = u64::from_le_bytes(buf[8..STAMP].try_into().unwrap());
        if let Some(expected) = stamped.get(&block) {
            if owner == worker + 1 && seen != *expected {
                warn!(worker, block, seen, expected, "unexpected stamp");
                report.corrupt += 1;
            }
        }

        if rng.gen_range(0..100) < writes {
            buf[..8].copy_from_slice(&(worker + 1).to_le_bytes());
            buf[8..STAMP].copy_from_slice(&sequence.to_le_bytes());
            buf.write().expect("write failed");
            stamped.insert(block, sequence);
            report.writes += 1;
            debug!(worker, block, sequence, "stamped");
        }
        buf.release();
    }
    report
}
