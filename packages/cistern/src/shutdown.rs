//! Ordered shutdown of a producer/consumer run.
//!
//! ```text
//! RUNNING ──(producers joined)──▶ DRAINING ──(sentinels put, consumers joined)──▶ TERMINATED
//! ```
//!
//! Every join is bounded. A worker that overruns its phase is reported, cancelled, and given a
//! short grace period to stop, so the protocol always reaches `TERMINATED` and returns a
//! [`Report`] rather than hanging.

use crate::{
    channel::{
        api::BoundedChannel,
        cancel::CancelToken,
        condition::Coordination,
        core::{ChannelStats, Entry},
    },
    worker::{JoinFailure, Message, Role, WorkerExit, WorkerHandle, WorkerReport},
};
use std::{
    fmt::{self, Display, Formatter},
    io,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};


/// Bounds on how long shutdown waits for workers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ShutdownOptions {
    /// Time each phase may take to join its workers, and to enqueue sentinels
    pub join_timeout: Duration,
    /// Time an overrunning worker is given to stop once cancelled
    pub grace: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        ShutdownOptions {
            join_timeout: Duration::from_secs(30),
            grace: Duration::from_secs(1),
        }
    }
}

/// State of the shutdown protocol
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Phase {
    /// Waiting for producers to put all their messages
    Running,
    /// Enqueuing sentinels and waiting for consumers to observe them
    Draining,
    /// Every worker joined or abandoned
    Terminated,
}

/// Something that kept a run from completing cleanly
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Fault {
    #[error("{worker} did not stop within the join timeout")]
    ShutdownTimeout { worker: String },
    #[error("{worker} was cancelled")]
    Cancelled { worker: String },
    #[error("{worker} panicked: {message}")]
    Panicked { worker: String, message: String },
    #[error("only {sent} of {expected} sentinels could be enqueued")]
    SentinelShortfall { sent: u64, expected: u64 },
    #[error("{payloads} payloads and {sentinels} sentinels left in the buffer")]
    Leftover { payloads: usize, sentinels: usize },
}

/// Final diagnostics of a run
#[derive(Debug, Clone)]
pub struct Report {
    pub produced_total: u64,
    /// Payloads consumed. Sentinels never count.
    pub consumed_total: u64,
    /// Entries buffered once every worker stopped, sentinels included
    pub final_buffer_size: usize,
    pub sentinels_sent: u64,
    pub sentinels_consumed: u64,
    /// Reports of workers that stopped, in join order
    pub workers: Vec<WorkerReport>,
    pub faults: Vec<Fault>,
    /// Channel counters as of termination
    pub stats: ChannelStats,
}

impl Report {
    /// Whether the run completed without any fault
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "produced total:     {}", self.produced_total)?;
        writeln!(f, "consumed total:     {}", self.consumed_total)?;
        writeln!(f, "final buffer size:  {}", self.final_buffer_size)?;
        writeln!(f, "sentinels sent:     {}", self.sentinels_sent)?;
        writeln!(f, "sentinels consumed: {}", self.sentinels_consumed)?;
        writeln!(f, "high water mark:    {}/{}", self.stats.high_water, self.stats.capacity)?;
        writeln!(
            f,
            "waits:              {} full, {} empty, {} futile wakeups, {} cancelled",
            self.stats.full_waits,
            self.stats.empty_waits,
            self.stats.futile_wakeups,
            self.stats.cancelled_waits,
        )?;
        for worker in &self.workers {
            writeln!(
                f,
                "  {:<14} {:<8} produced={:<4} consumed={:<4} exit={:?}",
                worker.name, worker.role, worker.produced, worker.consumed, worker.exit,
            )?;
        }
        if self.faults.is_empty() {
            write!(f, "clean shutdown")
        } else {
            write!(f, "{} fault(s):", self.faults.len())?;
            for fault in &self.faults {
                write!(f, "\n  - {}", fault)?;
            }
            Ok(())
        }
    }
}

/// Run the shutdown protocol over already-spawned workers
///
/// Joins every producer, enqueues one sentinel per consumer that stops on sentinels, joins every
/// consumer, then drains whatever remains in the channel. Failures along the way become
/// [`Fault`]s in the returned report. Errs only if the timer runtime used to bound joins cannot
/// be built.
///
/// Must not be called from within an async context.
pub fn run_to_completion<C: Coordination>(
    channel: &BoundedChannel<Message, C>,
    producers: Vec<WorkerHandle>,
    consumers: Vec<WorkerHandle>,
    opts: &ShutdownOptions,
) -> io::Result<Report> {
    let rt = Builder::new_current_thread().enable_time().build()?;
    let mut joiner = Joiner { rt, grace: opts.grace, workers: Vec::new(), faults: Vec::new() };

    // ==== running ====

    info!(
        phase = ?Phase::Running,
        producers = producers.len(),
        consumers = consumers.len(),
        "waiting for producers",
    );
    let deadline = Instant::now() + opts.join_timeout;
    for handle in producers {
        joiner.join(handle, deadline);
    }

    // ==== draining ====

    let expected = consumers.iter().filter(|handle| handle.expects_sentinel()).count() as u64;
    info!(phase = ?Phase::Draining, sentinels = expected, "producers joined, sending sentinels");
    let deadline = Instant::now() + opts.join_timeout;
    let cancel = CancelToken::new();
    let mut sentinels_sent = 0;
    while sentinels_sent < expected {
        if let Err(e) = channel.put_sentinel_deadline(deadline, &cancel) {
            warn!(sent = sentinels_sent, expected, "could not enqueue sentinel: {}", e);
            joiner.faults.push(Fault::SentinelShortfall { sent: sentinels_sent, expected });
            break;
        }
        sentinels_sent += 1;
    }
    for handle in consumers {
        joiner.join(handle, deadline);
    }

    // ==== terminated ====

    let stats = channel.stats();
    let mut payloads = 0;
    let mut sentinels = 0;
    while let Ok(entry) = channel.try_take() {
        match entry {
            Entry::Payload(msg) => {
                debug!(msg = %msg, "draining leftover payload");
                payloads += 1;
            }
            Entry::Sentinel => sentinels += 1,
        }
    }
    if payloads + sentinels > 0 {
        warn!(payloads, sentinels, "entries left in the buffer");
        joiner.faults.push(Fault::Leftover { payloads, sentinels });
    }

    let Joiner { workers, faults, .. } = joiner;
    let report = Report {
        produced_total: workers.iter()
            .filter(|w| w.role == Role::Producer)
            .map(|w| w.produced)
            .sum(),
        consumed_total: workers.iter()
            .filter(|w| w.role == Role::Consumer)
            .map(|w| w.consumed)
            .sum(),
        final_buffer_size: payloads + sentinels,
        sentinels_sent,
        sentinels_consumed: workers.iter()
            .filter(|w| w.exit == WorkerExit::Sentinel)
            .count() as u64,
        workers,
        faults,
        stats,
    };
    info!(
        phase = ?Phase::Terminated,
        produced = report.produced_total,
        consumed = report.consumed_total,
        faults = report.faults.len(),
        "shutdown complete",
    );
    Ok(report)
}

// joins workers, accumulating their reports and faults.
struct Joiner {
    rt: Runtime,
    grace: Duration,
    workers: Vec<WorkerReport>,
    faults: Vec<Fault>,
}

impl Joiner {
    fn join(&mut self, mut handle: WorkerHandle, deadline: Instant) {
        let worker = handle.name().to_owned();
        let mut timed_out = false;
        let mut result = handle.join_until(&self.rt, deadline);
        if matches!(result, Err(JoinFailure::TimedOut)) {
            warn!(%worker, "did not stop within the join timeout, cancelling");
            self.faults.push(Fault::ShutdownTimeout { worker: worker.clone() });
            timed_out = true;
            handle.cancel();
            result = handle.join_until(&self.rt, Instant::now() + self.grace);
        }
        match result {
            Ok(report) => {
                debug!(%worker, exit = ?report.exit, "joined");
                if report.exit == WorkerExit::Cancelled && !timed_out {
                    self.faults.push(Fault::Cancelled { worker });
                }
                self.workers.push(report);
            }
            Err(JoinFailure::TimedOut) => {
                error!(%worker, "did not stop even after cancellation, abandoning");
            }
            Err(JoinFailure::Panicked(message)) => {
                error!(%worker, %message, "panicked");
                self.faults.push(Fault::Panicked { worker, message });
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::condition::{BroadcastCondition, SplitCondition},
        worker::{ConsumerStop, Latency, MessageId, Spawner, Substrate},
    };
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::collections::BTreeSet;

    fn opts(join_timeout: Duration) -> ShutdownOptions {
        ShutdownOptions { join_timeout, grace: Duration::from_secs(5) }
    }

    fn run<C: Coordination>(
        spawner: &Spawner<C>,
        producers: usize,
        messages: u64,
        consumers: usize,
        opts: &ShutdownOptions,
    ) -> Report {
        let producers = (1..=producers)
            .map(|i| spawner.spawn_producer(format!("Producer-{}", i), messages).unwrap())
            .collect();
        let consumers = (1..=consumers)
            .map(|i| spawner.spawn_consumer(format!("Consumer-{}", i)).unwrap())
            .collect();
        run_to_completion(spawner.channel(), producers, consumers, opts).unwrap()
    }

    fn thread_spawner<C: Coordination>(capacity: usize) -> Spawner<C> {
        Spawner::new(BoundedChannel::new(capacity).unwrap(), Substrate::Threads)
    }

    fn received(report: &Report) -> Vec<MessageId> {
        report.workers.iter().flat_map(|w| w.received.iter().cloned()).collect()
    }

    #[test]
    fn concrete_scenario() {
        let spawner = thread_spawner::<SplitCondition>(5)
            .with_latency(Latency::millis(0, 10), Latency::millis(0, 20))
            .with_seed(Some(1));
        let report = run(&spawner, 2, 10, 2, &opts(Duration::from_secs(30)));
        assert!(report.is_clean(), "{}", report);
        assert_eq!(report.produced_total, 20);
        assert_eq!(report.consumed_total, 20);
        assert_eq!(report.final_buffer_size, 0);
        assert!(report.stats.high_water <= 5);
    }

    fn capacity_one_is_live_with<C: Coordination>() {
        for seed in 0..4 {
            let spawner = thread_spawner::<C>(1)
                .with_latency(Latency::millis(0, 50), Latency::millis(0, 50))
                .with_seed(Some(seed));
            let report = run(&spawner, 2, 5, 2, &opts(Duration::from_secs(20)));
            assert!(report.is_clean(), "{:?} seed {}: {}", C::MODE, seed, report);
            assert_eq!(report.produced_total, 10);
            assert_eq!(report.consumed_total, 10);
            assert_eq!(report.stats.high_water, 1);
        }
    }

    #[test]
    fn capacity_one_is_live() {
        capacity_one_is_live_with::<BroadcastCondition>();
        capacity_one_is_live_with::<SplitCondition>();
    }

    #[test]
    fn one_sentinel_per_consumer() {
        let mut rng = Pcg32::seed_from_u64(0xc157e);
        for _ in 0..8 {
            let capacity = rng.gen_range(1..=6);
            let producers = rng.gen_range(1..=4);
            let consumers = rng.gen_range(1..=4);
            let messages = rng.gen_range(0..=15);
            let spawner = thread_spawner::<SplitCondition>(capacity);
            let opts = opts(Duration::from_secs(20));
            let report = run(&spawner, producers, messages, consumers, &opts);

            assert!(report.is_clean(), "{}", report);
            assert_eq!(report.sentinels_sent, consumers as u64);
            assert_eq!(report.sentinels_consumed, consumers as u64);
            assert_eq!(report.stats.sentinels_taken, consumers as u64);
            for worker in report.workers.iter().filter(|w| w.role == Role::Consumer) {
                assert_eq!(worker.exit, WorkerExit::Sentinel);
            }

            // exactly once
            let mut got = received(&report);
            got.sort();
            let mut expected = (1..=producers)
                .flat_map(|p| (1..=messages).map(move |seq| MessageId {
                    origin: format!("Producer-{}", p).into(),
                    seq,
                }))
                .collect::<Vec<_>>();
            expected.sort();
            assert_eq!(got, expected);
            assert_eq!(got.iter().collect::<BTreeSet<_>>().len(), got.len());
        }
    }

    #[test]
    fn starved_quota_consumers_time_out() {
        let spawner = thread_spawner::<SplitCondition>(5);
        let producers = (1..=2)
            .map(|i| spawner.spawn_producer(format!("Producer-{}", i), 10).unwrap())
            .collect();
        let consumers = (1..=3)
            .map(|i| spawner
                .spawn_consumer_with(format!("Consumer-{}", i), ConsumerStop::Quota(10))
                .unwrap())
            .collect();
        let opts = opts(Duration::from_millis(500));
        let start = Instant::now();
        let report = run_to_completion(spawner.channel(), producers, consumers, &opts).unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(report.sentinels_sent, 0);
        assert_eq!(report.produced_total, 20);
        assert_eq!(report.consumed_total, 20);
        assert_eq!(report.final_buffer_size, 0);
        assert!(report.faults.iter().any(|f| matches!(f, Fault::ShutdownTimeout { .. })));
    }

    #[test]
    fn cancelled_consumer_yields_partial_report() {
        let spawner = thread_spawner::<SplitCondition>(2)
            .with_latency(Latency::ZERO, Latency::millis(5, 5));
        let producers = vec![spawner.spawn_producer("Producer-1", 20).unwrap()];
        let consumers = (1..=2)
            .map(|i| spawner.spawn_consumer(format!("Consumer-{}", i)).unwrap())
            .collect::<Vec<_>>();
        consumers[0].cancel();
        let opts = opts(Duration::from_secs(20));
        let report = run_to_completion(spawner.channel(), producers, consumers, &opts).unwrap();

        assert!(!report.is_clean());
        assert!(report.faults.contains(&Fault::Cancelled { worker: "Consumer-1".to_owned() }));
        assert_eq!(report.produced_total, 20);
        assert_eq!(report.consumed_total, 20);
        assert_eq!(report.sentinels_sent, 2);
        assert_eq!(report.sentinels_consumed, 1);
        assert_eq!(report.final_buffer_size, 1);
        assert!(report.faults.contains(&Fault::Leftover { payloads: 0, sentinels: 1 }));
    }

    #[test]
    fn sentinel_shortfall_is_reported() {
        let spawner = thread_spawner::<SplitCondition>(3);
        // cancelled before anything is produced, so nothing ever frees space for its sentinel
        let consumer = spawner.spawn_consumer("Consumer-1").unwrap();
        consumer.cancel();
        std::thread::sleep(Duration::from_millis(50));
        let producers = vec![spawner.spawn_producer("Producer-1", 3).unwrap()];
        let opts = opts(Duration::from_millis(300));
        let consumers = vec![consumer];
        let report = run_to_completion(spawner.channel(), producers, consumers, &opts).unwrap();

        assert_eq!(report.sentinels_sent, 0);
        assert!(report.faults.contains(&Fault::SentinelShortfall { sent: 0, expected: 1 }));
        assert!(report.faults.contains(&Fault::Cancelled { worker: "Consumer-1".to_owned() }));
        assert!(report.faults.contains(&Fault::Leftover { payloads: 3, sentinels: 0 }));
        assert_eq!(report.final_buffer_size, 3);
        assert_eq!(report.consumed_total, 0);
    }

    #[test]
    fn runs_on_blocking_pool() {
        let pool = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(8)
            .enable_time()
            .build()
            .unwrap();
        let channel = BoundedChannel::<_, BroadcastCondition>::new(3).unwrap();
        let spawner = Spawner::new(channel, Substrate::Pool(pool.handle().clone()))
            .with_latency(Latency::millis(0, 5), Latency::millis(0, 5))
            .with_seed(Some(9));
        let report = run(&spawner, 3, 7, 3, &opts(Duration::from_secs(20)));
        assert!(report.is_clean(), "{}", report);
        assert_eq!(report.consumed_total, 21);
    }
}
