use crossbeam_utils::thread::scope;
use log::info;
use rand::prelude::*;
use std::cmp::max;
use std::io::{stdout, Write};
use std::path::Path;
use std::sync::{mpsc, Arc, Barrier};
use std::thread::available_parallelism;
use std::time::Instant;
use typenum::{Unsigned, U1, U4};

use nbbst_benchmark::config::map::{setup, BenchWriter, Config, Op, OpsPerCs, Perf, DS};
use nbbst_benchmark::ds_impl::{
    ChromaticTree, EFRBBatchTree, PnbBatchTree, RangeMap, VcasBatchTree,
};

#[cfg(target_os = "linux")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    env_logger::init();
    let mm = Path::new(file!())
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ebr")
        .to_string();
    let (config, output) = setup(mm);
    match config.ops_per_cs {
        OpsPerCs::One => bench::<U1>(&config, output),
        OpsPerCs::Four => bench::<U4>(&config, output),
    }
}

fn bench<N: Unsigned>(config: &Config, output: BenchWriter) {
    println!("{}", config);
    info!(
        "{} threads over [0, {}), prefill {}, {}s",
        config.threads, config.key_range, config.prefill, config.interval
    );
    let perf = match config.ds {
        DS::EFRBBatch => bench_map::<EFRBBatchTree<usize, usize>, N>(config),
        DS::VcasBatch => bench_map::<VcasBatchTree<usize, usize>, N>(config),
        DS::PnbBatch => bench_map::<PnbBatchTree<usize, usize>, N>(config),
        DS::Chromatic => bench_map::<ChromaticTree<usize, usize>, N>(config),
    };
    if let Err(e) = output.write_record(config, &perf) {
        eprintln!("failed to write the result: {}", e);
    }
    println!("{}", perf);
}

/// Inserts keys in a random order, with multiple threads.
fn prefill<M: RangeMap<usize, usize> + Send + Sync>(config: &Config, map: &M) {
    let collector = &crossbeam_ebr::Collector::new();
    let threads = available_parallelism().map(|v| v.get()).unwrap_or(1);
    print!("prefilling with {threads} threads... ");
    stdout().flush().unwrap();
    scope(|s| {
        for t in 0..threads {
            s.spawn(move |_| {
                let handle = collector.register();
                let rng = &mut rand::thread_rng();
                let count =
                    config.prefill / threads + if t < config.prefill % threads { 1 } else { 0 };
                for _ in 0..count {
                    let key = config.key_dist.sample(rng);
                    let value = key;
                    map.insert(key, value, &handle.pin());
                }
            });
        }
    })
    .unwrap();
    print!("prefilled... ");
    stdout().flush().unwrap();
    info!("prefilled {} keys", map.size(&collector.register().pin()));
}

fn bench_map<M: RangeMap<usize, usize> + Send + Sync, N: Unsigned>(config: &Config) -> Perf {
    let map = &match M::with_params(config.params) {
        Ok(map) => map,
        Err(e) => panic!("invalid tree parameters: {}", e),
    };
    prefill(config, map);

    let collector = &crossbeam_ebr::Collector::new();

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        // sampling thread
        if config.aux_thread > 0 {
            let mem_sender = mem_sender.clone();
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                barrier.clone().wait();

                let start = Instant::now();
                let mut next_sampling = start + config.sampling_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;

                        acc += allocated;
                        peak = max(peak, allocated);

                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(config.aux_thread_period);
                }

                if config.sampling && samples > 0 {
                    mem_sender.send((peak, acc / samples)).unwrap();
                } else {
                    mem_sender.send((0, 0)).unwrap();
                }
            });
        } else {
            mem_sender.send((0, 0)).unwrap();
        }

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let mut scanned: u64 = 0;
                let mut rng = &mut rand::thread_rng();
                let handle = collector.register();
                barrier.clone().wait();
                let start = Instant::now();

                let mut guard = handle.pin();
                while start.elapsed() < config.duration {
                    let key = config.key_dist.sample(rng);
                    match Op::OPS[config.op_dist.sample(&mut rng)] {
                        Op::Get => {
                            map.get(&key, &guard);
                        }
                        Op::Insert => {
                            let value = key;
                            map.insert(key, value, &guard);
                        }
                        Op::Remove => {
                            map.remove(&key, &guard);
                        }
                        Op::RangeScan => {
                            let hi = key.saturating_add(config.range_len);
                            scanned += map.range_scan(&key, &hi, &guard).len() as u64;
                        }
                    }
                    ops += 1;
                    if ops % N::to_u64() == 0 {
                        drop(guard);
                        guard = handle.pin();
                    }
                }

                ops_sender.send((ops, scanned)).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let mut ops = 0;
    let mut scanned = 0;
    for _ in 0..config.threads {
        let (local_ops, local_scanned) = ops_receiver.recv().unwrap();
        ops += local_ops;
        scanned += local_scanned;
    }
    let interval = max(config.interval, 1);
    let (peak_mem, avg_mem) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec: ops / interval,
        peak_mem,
        avg_mem,
        scanned_per_sec: scanned / interval,
    }
}
