//! Command line driver for producer/consumer simulations over a cistern channel.

use anyhow::{bail, Context, Result};
use cistern::{
    config::{SimConfig, SubstrateKind},
    sim::simulate,
    worker::Latency,
    Mode,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;


/// Run producers and consumers against a bounded channel, then shut them down in order
///
/// Flags override the config file, which overrides the defaults. Log output follows `RUST_LOG`
/// when it is set.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// TOML config file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Channel capacity
    #[clap(long)]
    capacity: Option<usize>,

    /// Number of producers
    #[clap(long)]
    producers: Option<usize>,

    /// Number of consumers
    #[clap(long)]
    consumers: Option<usize>,

    /// Messages each producer puts
    #[clap(long)]
    messages: Option<u64>,

    /// Coordination strategy
    #[clap(long, value_enum)]
    mode: Option<ModeArg>,

    /// Run workers on a tokio blocking pool instead of dedicated threads
    #[clap(long)]
    pool: bool,

    /// Seed for latency randomness
    #[clap(long)]
    seed: Option<u64>,

    /// Consumers stop after this many messages instead of on a sentinel
    #[clap(long)]
    quota: Option<u64>,

    /// Skip simulated latency
    #[clap(long)]
    fast: bool,

    /// More log output (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
enum ModeArg {
    /// One wait-set, broadcast on every change
    Monitor,
    /// Separate "not full" and "not empty" wait-sets
    Split,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Monitor => Mode::Monitor,
            ModeArg::Split => Mode::Split,
        }
    }
}

impl Cli {
    fn into_config(self) -> Result<SimConfig> {
        let mut config = match &self.config {
            Some(path) => SimConfig::from_path(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SimConfig::default(),
        };
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(producers) = self.producers {
            config.producers = producers;
        }
        if let Some(consumers) = self.consumers {
            config.consumers = consumers;
        }
        if let Some(messages) = self.messages {
            config.messages_per_producer = messages;
        }
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if self.pool {
            config.substrate = SubstrateKind::Pool;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.quota.is_some() {
            config.consumer_quota = self.quota;
        }
        if self.fast {
            config.producer_latency = Latency::ZERO;
            config.consumer_latency = Latency::ZERO;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = cli.into_config()?;
    tracing::debug!(?config, "resolved config");

    let report = simulate(&config).context("simulation failed to run")?;
    println!("{}", report);
    if !report.is_clean() {
        bail!("run finished with {} fault(s)", report.faults.len());
    }
    Ok(())
}
