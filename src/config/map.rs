use crate::ds_impl::TreeParams;
use crate::MemSampler;
use clap::{value_parser, Arg, ArgAction, Command, ValueEnum};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

#[derive(PartialEq, Debug, ValueEnum, Clone)]
pub enum DS {
    #[value(name = "efrb-batch")]
    EFRBBatch,
    #[value(name = "vcas-batch")]
    VcasBatch,
    #[value(name = "pnb-batch")]
    PnbBatch,
    #[value(name = "chromatic")]
    Chromatic,
}

impl fmt::Display for DS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => write!(f, "{}", value.get_name()),
            None => write!(f, "{:?}", self),
        }
    }
}

pub enum OpsPerCs {
    One,
    Four,
}

impl fmt::Display for OpsPerCs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsPerCs::One => write!(f, "1"),
            OpsPerCs::Four => write!(f, "4"),
        }
    }
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Get,
    Insert,
    Remove,
    RangeScan,
}

impl Op {
    pub const OPS: [Op; 4] = [Op::Get, Op::Insert, Op::Remove, Op::RangeScan];
}

#[derive(Clone, Copy, PartialEq)]
pub enum GetRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl GetRate {
    /// Relative weights of get, insert and remove.
    fn weights(self) -> [u32; 3] {
        match self {
            GetRate::WriteOnly => [0, 1, 1],
            GetRate::ReadWrite => [2, 1, 1],
            GetRate::ReadIntensive => [18, 1, 1],
            GetRate::ReadOnly => [1, 0, 0],
        }
    }
}

/// Weights of [`Op::OPS`]: `range_rate` percent of the operations are range
/// scans and the rest follow the point mix of `get_rate`.
fn op_weights(get_rate: GetRate, range_rate: u32) -> [u32; 4] {
    let point = get_rate.weights();
    let total: u32 = point.iter().sum();
    let scale = 100 - range_rate;
    [
        point[0] * scale,
        point[1] * scale,
        point[2] * scale,
        range_rate * total,
    ]
}

pub struct Config {
    pub ds: DS,
    pub mm: String,
    pub threads: usize,
    pub params: TreeParams,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub get_rate: GetRate,
    pub range_rate: u32,
    pub range_len: usize,
    pub op_dist: WeightedIndex<u32>,
    pub key_dist: Uniform<usize>,
    pub prefill: usize,
    pub key_range: usize,
    pub interval: u64,
    pub duration: Duration,
    pub ops_per_cs: OpsPerCs,

    pub mem_sampler: MemSampler,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} threads, B{}, d{}, c{}, g{}, q{}x{}",
            self.ds,
            self.threads,
            self.params.batching_degree,
            self.params.allowed_violations,
            self.ops_per_cs,
            self.get_rate as u8,
            self.range_rate,
            self.range_len,
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    /// Keys visited by range scans per second.
    pub scanned_per_sec: u64,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, scanned keys/s: {}, peak mem: {}, avg_mem: {}",
            self.ops_per_sec,
            self.scanned_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
        )
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    for (i, unit) in UNITS.iter().enumerate() {
        if num / 2usize.pow(i as u32 * 10) < 1000 {
            return format!("{:.3} {}", num as f64 / 2f64.powf(i as f64 * 10.0), unit);
        }
    }
    format!(
        "{:.3} {}",
        num as f64 / 2f64.powf((UNITS.len() - 1) as f64 * 10.0),
        UNITS[UNITS.len() - 1]
    )
}

const HEADER: [&str; 15] = [
    "ds",
    "mm",
    "threads",
    "batching_degree",
    "allowed_violations",
    "sampling_period",
    "get_rate",
    "range_rate",
    "range_len",
    "ops_per_cs",
    "throughput",
    "scanned",
    "peak_mem",
    "avg_mem",
    "key_range",
];

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) -> csv::Result<()> {
        if let Some(mut output) = self.output {
            output.write_record(&[
                config.ds.to_string(),
                config.mm.clone(),
                config.threads.to_string(),
                config.params.batching_degree.to_string(),
                config.params.allowed_violations.to_string(),
                config.sampling_period.as_millis().to_string(),
                (config.get_rate as u8).to_string(),
                config.range_rate.to_string(),
                config.range_len.to_string(),
                config.ops_per_cs.to_string(),
                perf.ops_per_sec.to_string(),
                perf.scanned_per_sec.to_string(),
                perf.peak_mem.to_string(),
                perf.avg_mem.to_string(),
                config.key_range.to_string(),
            ])?;
            output.flush()?;
        }
        Ok(())
    }
}

/// Opens `path` for appending, writing the header first if the file is new.
fn open_output(path: &Path) -> csv::Result<Writer<File>> {
    if let Some(dir) = path.parent() {
        create_dir_all(dir)?;
    }
    if let Ok(f) = OpenOptions::new().read(true).append(true).open(path) {
        return Ok(csv::Writer::from_writer(f));
    }
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let mut output = csv::Writer::from_writer(f);
    // NOTE: `write_record` on `bench`
    output.write_record(HEADER)?;
    output.flush()?;
    Ok(output)
}

fn command(mm: String) -> Command {
    Command::new(mm)
        .arg(
            Arg::new("data structure")
                .short('d')
                .value_parser(value_parser!(DS))
                .required(true)
                .ignore_case(true)
                .help("Data structure"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("get rate")
                .short('g')
                .help(
                    "The proportion of `get`(read) operations among point operations. \
                     0: 0%, 1: 50%, 2: 90%, 3: 100%",
                )
                .value_parser(value_parser!(u8).range(0..4))
                .default_value("0"),
        )
        .arg(
            Arg::new("range rate")
                .short('q')
                .help("Percentage of operations that are range scans")
                .value_parser(value_parser!(u32).range(0..=100))
                .default_value("0"),
        )
        .arg(
            Arg::new("range length")
                .short('l')
                .help("Width of the key interval covered by a range scan")
                .value_parser(value_parser!(usize))
                .default_value("100"),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .value_parser(value_parser!(usize))
                .help("Key range: [0..RANGE]")
                .default_value("100000"),
        )
        .arg(
            Arg::new("batching degree")
                .short('b')
                .value_parser(value_parser!(usize))
                .help("Maximum number of keys per leaf")
                .default_value("16"),
        )
        .arg(
            Arg::new("allowed violations")
                .short('v')
                .value_parser(value_parser!(usize))
                .help("Violations tolerated on a search path before rebalancing (chromatic only)")
                .default_value("6"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64))
                .help("Time interval in seconds to run the benchmark")
                .default_value("10"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .help(
                    "The period to query jemalloc stats.allocated (ms). 0 for no sampling. \
                     Only supported on linux.",
                )
                .default_value("1"),
        )
        .arg(
            Arg::new("ops per cs")
                .short('c')
                .value_parser(["1", "4"])
                .help("Operations per each critical section")
                .default_value("1"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .help("Output CSV filename. Appends the data if the file already exists."),
        )
        .arg(
            Arg::new("dry run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Check whether the arguments are parsable, without running a benchmark"),
        )
}

pub fn setup(mm: String) -> (Config, BenchWriter) {
    let mut cmd = command(mm.clone());
    let m = cmd.get_matches_mut();

    // Every argument below is either required or has a default.
    let ds = m.get_one::<DS>("data structure").cloned().unwrap();
    let threads = m.get_one::<usize>("threads").copied().unwrap();
    let get_rate = match m.get_one::<u8>("get rate").copied().unwrap() {
        0 => GetRate::WriteOnly,
        1 => GetRate::ReadWrite,
        2 => GetRate::ReadIntensive,
        3 => GetRate::ReadOnly,
        _ => unreachable!("get_rate is invalid"),
    };
    let range_rate = m.get_one::<u32>("range rate").copied().unwrap();
    let range_len = m.get_one::<usize>("range length").copied().unwrap();
    let key_range = m.get_one::<usize>("range").copied().unwrap();
    let prefill = key_range / 2;
    let key_dist = Uniform::from(0..key_range);
    let interval = m.get_one::<u64>("interval").copied().unwrap();
    let sampling_period = m.get_one::<u64>("sampling period").copied().unwrap();
    let sampling = sampling_period > 0 && cfg!(target_os = "linux");
    let ops_per_cs = match m.get_one::<String>("ops per cs").unwrap().as_str() {
        "1" => OpsPerCs::One,
        "4" => OpsPerCs::Four,
        _ => unreachable!("ops_per_cs should be one or four"),
    };
    let duration = Duration::from_secs(interval);

    let params = TreeParams::default()
        .batching_degree(m.get_one::<usize>("batching degree").copied().unwrap())
        .allowed_violations(m.get_one::<usize>("allowed violations").copied().unwrap());
    let params = match params.validate() {
        Ok(params) => params,
        Err(e) => cmd
            .error(clap::error::ErrorKind::ValueValidation, e)
            .exit(),
    };

    let op_dist = match WeightedIndex::new(op_weights(get_rate, range_rate)) {
        Ok(dist) => dist,
        Err(e) => cmd
            .error(
                clap::error::ErrorKind::ArgumentConflict,
                format!("the operation mix is empty: {}", e),
            )
            .exit(),
    };

    let output = m.get_one::<String>("output").map(|output_name| {
        match open_output(Path::new(output_name)) {
            Ok(output) => output,
            Err(e) => cmd
                .error(
                    clap::error::ErrorKind::Io,
                    format!("cannot open {}: {}", output_name, e),
                )
                .exit(),
        }
    });
    let mem_sampler = MemSampler::new();
    let config = Config {
        ds,
        mm,
        threads,
        params,

        aux_thread: if sampling { 1 } else { 0 },
        aux_thread_period: Duration::from_millis(1),
        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        get_rate,
        range_rate,
        range_len,
        op_dist,
        key_dist,
        prefill,
        key_range,
        interval,
        duration,
        ops_per_cs,

        mem_sampler,
    };

    if m.get_flag("dry run") {
        std::process::exit(0);
    }

    (config, BenchWriter { output })
}

#[cfg(test)]
mod tests {
    use super::{command, op_weights, GetRate, DS};

    #[test]
    fn op_mix() {
        assert_eq!(op_weights(GetRate::ReadWrite, 0), [200, 100, 100, 0]);
        assert_eq!(op_weights(GetRate::WriteOnly, 10), [0, 90, 90, 20]);
        assert_eq!(op_weights(GetRate::ReadOnly, 100), [0, 0, 0, 100]);
    }

    #[test]
    fn parses_tree_names() {
        let m = command("ebr".to_string())
            .try_get_matches_from(["ebr", "-d", "vcas-batch", "-t", "4", "-b", "32"])
            .unwrap();
        assert_eq!(m.get_one::<DS>("data structure"), Some(&DS::VcasBatch));
        assert_eq!(m.get_one::<usize>("batching degree"), Some(&32));
        assert_eq!(m.get_one::<usize>("allowed violations"), Some(&6));
        let m = command("ebr".to_string())
            .try_get_matches_from(["ebr", "-d", "PNB-Batch", "-t", "1"])
            .unwrap();
        assert_eq!(m.get_one::<DS>("data structure"), Some(&DS::PnbBatch));
        assert_eq!(DS::PnbBatch.to_string(), "pnb-batch");
        assert!(command("ebr".to_string())
            .try_get_matches_from(["ebr", "-d", "skiplist", "-t", "4"])
            .is_err());
    }
}
