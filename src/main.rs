use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use console::style;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use visersim::config::{self, Config};

#[derive(Debug, Parser)]
#[command(author, version, about = "Region conflict detection cache simulator", long_about = None)]
struct Options {
    /// JSON lines trace to replay
    #[arg(value_name = "TRACE")]
    trace: PathBuf,
    /// YAML machine configuration (defaults otherwise)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
    /// Coherence protocol, overriding the configuration (viser or mesi)
    #[arg(short, long)]
    protocol: Option<config::Protocol>,
    /// Number of cores, overriding the configuration
    #[arg(long)]
    cores: Option<usize>,
    /// Check cache invariants every this many events
    #[arg(long)]
    verify_every: Option<u64>,
    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Serialize)]
struct JsonStats {
    protocol: config::Protocol,
    num_cores: usize,
    events: usize,
    counters: BTreeMap<String, usize>,
    l1: Vec<stats::cache::PerCacheRow>,
    l2: Vec<stats::cache::PerCacheRow>,
    l3: Vec<stats::cache::PerCacheRow>,
    aim: Vec<stats::cache::PerCacheRow>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load_config(options: &Options) -> eyre::Result<Config> {
    let mut config = match options.config {
        Some(ref path) => Config::from_yaml_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(protocol) = options.protocol {
        config.protocol = protocol;
    }
    if let Some(cores) = options.cores {
        config.num_cores = cores;
    }
    if let Some(verify_every) = options.verify_every {
        config.verify_every = verify_every;
    }
    Ok(config)
}

fn print_summary(config: &Config, events: usize, stats: &stats::Machine) {
    println!(
        "{} {} events on {}",
        style("visersim").bold(),
        events,
        style(config).cyan()
    );
    for (name, per_core) in [
        ("L1", &stats.l1),
        ("L2", &stats.l2),
        ("L3", &stats.l3),
        ("AIM", &stats.aim),
    ] {
        let total = per_core.reduce();
        let accesses = total.total_accesses();
        let misses = total.misses();
        let miss_rate = if accesses == 0 {
            0.0
        } else {
            misses as f64 / accesses as f64 * 100.0
        };
        println!(
            "{:>4}: {accesses:>10} accesses {misses:>10} misses ({miss_rate:5.1}%) {:>10} evictions",
            style(name).green(),
            total.get(stats::Event::LineEviction),
        );
    }
    for (counter, count) in stats.counters.iter().filter(|(_, count)| *count > 0) {
        let name = counter.to_string();
        let name = if counter.is_conflict() {
            style(name).red()
        } else {
            style(name).dim()
        };
        println!("{name:<40} {count:>12}");
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();
    init_logging(options.verbose);

    let config = load_config(&options)?;
    let start = std::time::Instant::now();
    let mut sim = visersim::build(config.clone())?;
    let events = visersim::trace::replay_file(sim.as_mut(), &options.trace)
        .wrap_err_with(|| format!("failed to replay {}", options.trace.display()))?;
    log::info!("replayed {events} events in {:?}", start.elapsed());

    let stats = sim.stats();
    if options.json {
        let json = JsonStats {
            protocol: config.protocol,
            num_cores: config.num_cores,
            events,
            counters: stats
                .counters
                .iter()
                .map(|(counter, count)| (counter.to_string(), count))
                .collect(),
            l1: stats.l1.clone().flatten(),
            l2: stats.l2.clone().flatten(),
            l3: stats.l3.clone().flatten(),
            aim: stats.aim.clone().flatten(),
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        print_summary(&config, events, &stats);
    }
    Ok(())
}
