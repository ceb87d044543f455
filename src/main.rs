use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use log::{error, info};

use distore::cluster::{parse_memory_node_list, ComputeConfig, MemoryConfig};
use distore::memory_node::MemoryNode;
use distore::stats::LatencyRecorder;
use distore::workload::{MixKind, Operation, WorkloadGenerator};
use distore::ComputeNode;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NodeKind {
    Compute,
    Memory,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Workload {
    A,
    B,
    C,
    L,
}

impl From<Workload> for MixKind {
    fn from(w: Workload) -> MixKind {
        match w {
            Workload::A => MixKind::A,
            Workload::B => MixKind::B,
            Workload::C => MixKind::C,
            Workload::L => MixKind::L,
        }
    }
}

/// DiStore node launcher and benchmark front-end.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Role of this process
    #[arg(long = "type", value_enum)]
    node_type: NodeKind,

    /// This node's own config file
    #[arg(long)]
    config: PathBuf,

    /// Memory-node list (compute nodes only)
    #[arg(long)]
    memory_nodes: Option<PathBuf>,

    /// Client threads to run
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Total operations across all threads
    #[arg(long, default_value_t = 100_000)]
    size: u64,

    /// Operation mix
    #[arg(long, value_enum, default_value = "l")]
    workload: Workload,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let result = match args.node_type {
        NodeKind::Memory => run_memory(&args),
        NodeKind::Compute => run_compute(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_memory(args: &Args) -> Result<(), distore::StoreError> {
    let config = MemoryConfig::load(&args.config)?;
    let node = MemoryNode::new(config);
    node.serve()
}

fn run_compute(args: &Args) -> Result<(), distore::StoreError> {
    let config = ComputeConfig::load(&args.config)?;
    let list = args
        .memory_nodes
        .as_ref()
        .ok_or(distore::ConfigError::MissingField("memory_nodes"))?;
    let memory_nodes = parse_memory_node_list(list)?;
    let node = ComputeNode::connect(&config, memory_nodes)?;

    let threads = args.threads.max(1);
    let per_thread = args.size / threads as u64;
    let mix = MixKind::from(args.workload);
    let range = args.size.max(1);
    info!(
        "running {:?} workload: {} threads x {} ops over {} keys",
        args.workload, threads, per_thread, range
    );

    let start = Instant::now();
    let mut stats = LatencyRecorder::new();
    std::thread::scope(|scope| -> Result<(), distore::StoreError> {
        let mut workers = Vec::new();
        for tid in 0..threads {
            let node = node.clone();
            workers.push(scope.spawn(move || -> Result<LatencyRecorder, distore::StoreError> {
                let mut client = node.register_thread()?;
                let mut gen = WorkloadGenerator::new(mix, range, tid as u64 + 1);
                let mut rec = LatencyRecorder::new();
                for _ in 0..per_thread {
                    let op = gen.next();
                    let begin = Instant::now();
                    match op {
                        Operation::Insert(k) => {
                            client.put(&k, &k)?;
                        }
                        Operation::Update(k) => {
                            client.update(&k, &k)?;
                        }
                        Operation::Search(k) => {
                            client.get(&k)?;
                        }
                    }
                    rec.record(begin.elapsed());
                }
                Ok(rec)
            }));
        }
        for w in workers {
            let rec = w.join().expect("worker thread panicked")?;
            stats.merge(rec);
        }
        Ok(())
    })?;

    let elapsed = start.elapsed();
    let summary = stats.summarize();
    let throughput = args.size as f64 / elapsed.as_secs_f64();
    println!("{summary}");
    println!("{:.0} ops/s over {:?}", throughput, elapsed);
    Ok(())
}
