//! bench-kv: workload harness for the cache simulator.
//!
//! Wires a logical client and a rack of cache nodes to one of the
//! application stacks (memcache-style or directory-coherence), drives a
//! synthetic workload through the virtual clock, and dumps latency
//! statistics: a summary to stdout, optionally a CDF file and a per-epoch
//! percentile file.

use std::cell::RefCell;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use pegasus_sim::kv::{KVStats, OpType};
use pegasus_sim::memcachekv::{
    BoundedAverageLoadConfig, BoundedIPLoadConfig, BoundedLoadConfig, ConfigHandle, LoadBalanceConfig,
    LoadMode, MemcacheKVClient, MemcacheKVMigrationServer, MemcacheKVServer, RoutingConfig,
    StaticConfig, WriteMode,
};
use pegasus_sim::node::{Node, Rack};
use pegasus_sim::param::MED_PKT_PROC_LTC;
use pegasus_sim::pegasuskv::{PegasusConfigHandle, PegasusKVClient, PegasusKVServer, SingleDirectoryConfig};
use pegasus_sim::simulator::{Service, Simulator};
use pegasus_sim::workload::{rand_string, IntervalDist, KeyDist, WorkloadGenerator};
use pegasus_sim::{NodeId, SimError, Time};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AppArg {
    Memcache,
    Pegasus,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeyTypeArg {
    Unif,
    Zipf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IntervalTypeArg {
    Unif,
    Poiss,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigTypeArg {
    Static,
    Loadbalance,
    Boundedload,
    Vload,
    Avgload,
    Routing,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoadModeArg {
    Iload,
    Pload,
    Ipload,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WriteModeArg {
    Anynode,
    Update,
    Invalidate,
}

#[derive(Debug, Parser)]
#[command(name = "bench-kv", about = "Key-value cache simulation benchmark")]
struct Args {
    /// Zipf distribution parameter
    #[arg(short, long, default_value_t = 0.5)]
    alpha: f64,
    /// Application stack
    #[arg(short = 'b', long, value_enum)]
    app: AppArg,
    /// Processors per cache node
    #[arg(short = 'c', long, default_value_t = 1)]
    procs: usize,
    /// Duration of the simulation (seconds of virtual time)
    #[arg(short, long)]
    duration: u64,
    /// Key distribution type
    #[arg(short = 'e', long, value_enum)]
    keytype: KeyTypeArg,
    /// Latency report epoch (ms); 0 disables epoch rollups
    #[arg(short = 'f', long, default_value_t = 0)]
    epoch: u64,
    /// GET ratio (0.0 to 1.0)
    #[arg(short, long)]
    gets: f64,
    /// Mean interval between operations (us)
    #[arg(short, long)]
    interval: f64,
    /// Epoch latencies output file
    #[arg(short = 'j', long)]
    epochfile: Option<PathBuf>,
    /// Number of keys
    #[arg(short, long)]
    keys: usize,
    /// Key length (bytes)
    #[arg(short, long)]
    length: usize,
    /// Load uninitialized keys on their first GET
    #[arg(short = 'm', long)]
    initkey: bool,
    /// Number of cache nodes
    #[arg(short, long)]
    nodes: usize,
    /// Latency CDF output file
    #[arg(short = 'o', long)]
    cdffile: Option<PathBuf>,
    /// PUT ratio (0.0 to 1.0)
    #[arg(short, long)]
    puts: f64,
    /// Load rebalance report interval (ms)
    #[arg(short, long, default_value_t = 0)]
    report: u64,
    /// Log progress during the run
    #[arg(short = 's', long)]
    progress: bool,
    /// Interval distribution type
    #[arg(short = 't', long, value_enum)]
    intervaltype: IntervalTypeArg,
    /// Value length (bytes)
    #[arg(short = 'v', long)]
    values: usize,
    /// Configuration policy (memcache only)
    #[arg(long, value_enum, default_value = "static")]
    configtype: ConfigTypeArg,
    /// Bounded-load constant c (>= 1)
    #[arg(long, default_value_t = 1.0)]
    loadbound: f64,
    /// Load signal for the vload policy
    #[arg(long, value_enum, default_value = "ipload")]
    loadmode: LoadModeArg,
    /// Write fan-out mode (memcache only)
    #[arg(long, value_enum, default_value = "update")]
    writemode: WriteModeArg,
    /// RNG seed; runs with the same seed and knobs are identical
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };
    env_logger::init();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bench-kv: {err:#}");
            match err.downcast_ref::<SimError>() {
                Some(SimError::Protocol(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    if args.duration == 0 {
        return Err(SimError::Config("duration must be at least one second".into()).into());
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let keys: Vec<String> = (0..args.keys)
        .map(|_| rand_string(args.length, &mut rng))
        .collect();
    let key_dist = match args.keytype {
        KeyTypeArg::Unif => KeyDist::Uniform,
        KeyTypeArg::Zipf => KeyDist::Zipf,
    };
    let interval_dist = match args.intervaltype {
        IntervalTypeArg::Unif => IntervalDist::Uniform,
        IntervalTypeArg::Poiss => IntervalDist::Poisson,
    };
    let generator = WorkloadGenerator::new(
        keys,
        args.values,
        args.gets,
        args.puts,
        key_dist,
        interval_dist,
        args.interval,
        args.alpha,
        args.initkey,
    )?;
    let stats = Rc::new(RefCell::new(KVStats::with_epoch_len(args.epoch * 1000)));

    info!(
        "simulating {} cache nodes x {} procs for {} s ({:?})",
        args.nodes, args.procs, args.duration, args.app
    );
    let (end_time, drops) = match args.app {
        AppArg::Memcache => run_memcache(&args, rng, generator, stats.clone())?,
        AppArg::Pegasus => run_pegasus(&args, rng, generator, stats.clone())?,
    };
    stats.borrow_mut().stats_mut().report_end_time(end_time);
    if drops > 0 {
        info!("drop-tail discarded {drops} messages in total");
    }

    let result = dump(&args, &stats.borrow());
    result
}

fn build_memcache_config(
    args: &Args,
    cache_ids: Vec<NodeId>,
    write_mode: WriteMode,
) -> Result<(Rc<RefCell<dyn Service>>, ConfigHandle), SimError> {
    Ok(match args.configtype {
        ConfigTypeArg::Static => {
            let config = Rc::new(RefCell::new(StaticConfig::new(cache_ids, write_mode)?));
            let service: Rc<RefCell<dyn Service>> = config.clone();
            (service, config)
        }
        ConfigTypeArg::Loadbalance => {
            let config = Rc::new(RefCell::new(LoadBalanceConfig::new(
                cache_ids,
                write_mode,
                1_000_000 / MED_PKT_PROC_LTC,
                args.report * 1000,
            )?));
            let service: Rc<RefCell<dyn Service>> = config.clone();
            (service, config)
        }
        ConfigTypeArg::Boundedload => {
            let config = Rc::new(RefCell::new(BoundedLoadConfig::new(
                cache_ids,
                write_mode,
                args.loadbound,
            )?));
            let service: Rc<RefCell<dyn Service>> = config.clone();
            (service, config)
        }
        ConfigTypeArg::Vload => {
            let mode = match args.loadmode {
                LoadModeArg::Iload => LoadMode::ILoad,
                LoadModeArg::Pload => LoadMode::PLoad,
                LoadModeArg::Ipload => LoadMode::IPLoad,
            };
            let config = Rc::new(RefCell::new(BoundedIPLoadConfig::new(
                cache_ids,
                write_mode,
                args.loadbound,
                mode,
            )?));
            let service: Rc<RefCell<dyn Service>> = config.clone();
            (service, config)
        }
        ConfigTypeArg::Avgload => {
            let config = Rc::new(RefCell::new(BoundedAverageLoadConfig::new(
                cache_ids,
                write_mode,
                args.loadbound,
            )?));
            let service: Rc<RefCell<dyn Service>> = config.clone();
            (service, config)
        }
        ConfigTypeArg::Routing => {
            let config = Rc::new(RefCell::new(RoutingConfig::new(
                cache_ids,
                write_mode,
                args.loadbound,
            )?));
            let service: Rc<RefCell<dyn Service>> = config.clone();
            (service, config)
        }
    })
}

fn run_memcache(
    args: &Args,
    rng: StdRng,
    generator: WorkloadGenerator,
    stats: Rc<RefCell<KVStats>>,
) -> Result<(Time, u64)> {
    let cache_ids: Vec<NodeId> = (0..args.nodes).collect();
    let write_mode = match args.writemode {
        WriteModeArg::Anynode => WriteMode::AnyNode,
        WriteModeArg::Update => WriteMode::Update,
        WriteModeArg::Invalidate => WriteMode::Invalidate,
    };
    let (service, config) = build_memcache_config(args, cache_ids, write_mode)?;
    let migration_servers = matches!(args.configtype, ConfigTypeArg::Routing);

    let mut sim = Simulator::new(rng);
    if args.progress {
        sim = sim.with_progress();
    }
    let rack = Rack::new(0);
    let mut client = Node::new(&rack, args.nodes).logical_client();
    client.register_app(Box::new(MemcacheKVClient::new(
        config.clone(),
        stats.clone(),
        Some(Box::new(generator)),
    )));
    sim.add_node(client);
    for id in 0..args.nodes {
        let mut node = Node::new(&rack, id).with_procs(args.procs).drop_tail();
        if migration_servers {
            node.register_app(Box::new(MemcacheKVMigrationServer::new(config.clone())));
        } else {
            node.register_app(Box::new(MemcacheKVServer::new(config.clone())));
        }
        sim.add_node(node);
    }
    sim.register_service(service);
    sim.register_service(stats);

    let end_time = sim.run(args.duration * 1_000_000)?;
    let drops = report_drops(sim.nodes());
    Ok((end_time, drops))
}

fn run_pegasus(
    args: &Args,
    rng: StdRng,
    generator: WorkloadGenerator,
    stats: Rc<RefCell<KVStats>>,
) -> Result<(Time, u64)> {
    let cache_ids: Vec<NodeId> = (0..args.nodes).collect();
    // Cache node 0 doubles as the coherence directory.
    let config = Rc::new(RefCell::new(SingleDirectoryConfig::new(cache_ids, 0)?));
    let service: Rc<RefCell<dyn Service>> = config.clone();
    let config: PegasusConfigHandle = config;

    let mut sim = Simulator::new(rng);
    if args.progress {
        sim = sim.with_progress();
    }
    let rack = Rack::new(0);
    let mut client = Node::new(&rack, args.nodes).logical_client();
    client.register_app(Box::new(PegasusKVClient::new(
        config.clone(),
        stats.clone(),
        Some(Box::new(generator)),
    )));
    sim.add_node(client);
    for id in 0..args.nodes {
        let mut node = Node::new(&rack, id).with_procs(args.procs).drop_tail();
        node.register_app(Box::new(PegasusKVServer::new(config.clone())));
        sim.add_node(node);
    }
    sim.register_service(service);
    sim.register_service(stats);

    let end_time = sim.run(args.duration * 1_000_000)?;
    let drops = report_drops(sim.nodes());
    Ok((end_time, drops))
}

fn report_drops<M: pegasus_sim::message::Payload>(nodes: &[Node<M>]) -> u64 {
    let mut total = 0;
    for node in nodes {
        if node.drops() > 0 {
            warn!("node {} dropped {} messages", node.id(), node.drops());
            total += node.drops();
        }
    }
    total
}

fn dump(args: &Args, stats: &KVStats) -> Result<()> {
    match stats.stats().summary() {
        Some(summary) => {
            println!("Throughput: {:.2}", summary.throughput);
            println!("Average Latency: {:.2}", summary.average);
            println!("Median Latency: {}", summary.median);
            println!("90% Latency: {}", summary.p90);
            println!("99% Latency: {}", summary.p99);
        }
        None => warn!("no operations completed"),
    }
    if let Some(rate) = stats.hit_rate() {
        println!("Cache Hit Rate: {rate:.4}");
    }
    let total = stats.stats().total_ops();
    if total > 0 {
        println!(
            "GET percentage: {:.4}",
            stats.received(OpType::Get) as f64 / total as f64
        );
        println!(
            "PUT percentage: {:.4}",
            stats.received(OpType::Put) as f64 / total as f64
        );
        println!(
            "DEL percentage: {:.4}",
            stats.received(OpType::Del) as f64 / total as f64
        );
    }

    if let Some(path) = &args.cdffile {
        let mut writer = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        stats
            .stats()
            .write_cdf(&mut writer)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &args.epochfile {
        if !stats.stats().epochs().is_empty() {
            let mut writer = BufWriter::new(
                File::create(path).with_context(|| format!("creating {}", path.display()))?,
            );
            stats
                .stats()
                .write_epochs(&mut writer, args.epoch)
                .with_context(|| format!("writing {}", path.display()))?;
        }
    }
    Ok(())
}
