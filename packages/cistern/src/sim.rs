//! End-to-end simulation: build a channel, spawn workers, run the shutdown protocol.

use crate::{
    channel::{
        api::BoundedChannel,
        condition::{BroadcastCondition, Coordination, Mode, SplitCondition},
        error::InvalidCapacity,
    },
    config::{ConfigError, SimConfig, SubstrateKind},
    shutdown::{run_to_completion, Report},
    worker::{Message, SpawnError, Spawner, Substrate, WorkerHandle},
};
use std::{io, time::Duration};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};


// how long tearing down the worker pool may wait for abandoned workers.
const POOL_TEARDOWN: Duration = Duration::from_secs(1);


/// Error that prevented a simulation from running at all
///
/// Failures during the run are not errors; they are faults in the [`Report`].
#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capacity(#[from] InvalidCapacity),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("failed to build runtime")]
    Runtime(#[source] io::Error),
}

/// Run one simulation to completion
///
/// Spawns `Producer-1..=P` and `Consumer-1..=C` onto a channel using the configured strategy and
/// substrate, then runs [`run_to_completion`].
pub fn simulate(config: &SimConfig) -> Result<Report, SimError> {
    config.validate()?;
    match config.mode {
        Mode::Monitor => simulate_with::<BroadcastCondition>(config),
        Mode::Split => simulate_with::<SplitCondition>(config),
    }
}

fn simulate_with<C: Coordination>(config: &SimConfig) -> Result<Report, SimError> {
    let channel = BoundedChannel::<Message, C>::new(config.capacity)?;
    let pool = match config.substrate {
        SubstrateKind::Threads => None,
        SubstrateKind::Pool => Some(build_pool(config.producers + config.consumers)?),
    };
    let substrate = match &pool {
        Some(pool) => Substrate::Pool(pool.handle().clone()),
        None => Substrate::Threads,
    };
    let spawner = Spawner::new(channel.clone(), substrate)
        .with_latency(config.producer_latency, config.consumer_latency)
        .with_seed(config.seed);

    info!(
        mode = ?C::MODE,
        substrate = ?config.substrate,
        capacity = config.capacity,
        producers = config.producers,
        consumers = config.consumers,
        messages = config.messages_per_producer,
        "starting simulation",
    );
    let mut producers = Vec::with_capacity(config.producers);
    let mut consumers = Vec::with_capacity(config.consumers);
    let spawned = (|| {
        for i in 1..=config.producers {
            let name = format!("Producer-{}", i);
            producers.push(spawner.spawn_producer(name, config.messages_per_producer)?);
        }
        for i in 1..=config.consumers {
            let name = format!("Consumer-{}", i);
            consumers.push(spawner.spawn_consumer_with(name, config.consumer_stop())?);
        }
        Ok::<_, SpawnError>(())
    })();
    if let Err(e) = spawned {
        error!(worker = %e.name, "failed to spawn, cancelling workers already running");
        producers.iter().chain(&consumers).for_each(WorkerHandle::cancel);
        return Err(e.into());
    }

    let report = run_to_completion(&channel, producers, consumers, &config.shutdown_options())
        .map_err(SimError::Runtime)?;
    if let Some(pool) = pool {
        pool.shutdown_timeout(POOL_TEARDOWN);
    }
    Ok(report)
}

// every worker holds a blocking thread for its whole life, so the pool must fit them all at once.
fn build_pool(workers: usize) -> Result<Runtime, SimError> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(workers)
        .thread_name("cistern-pool")
        .enable_time()
        .build()
        .map_err(SimError::Runtime)
}
