//! Producer and consumer workers.
//!
//! A worker is one unit of concurrent execution driving a [`BoundedChannel`]: producers put a
//! fixed number of [`Message`]s, consumers take until they dequeue a sentinel (or reach a quota).
//! Both sleep a random [`Latency`] between operations. Workers run on a [`Substrate`], either one
//! named OS thread each or the tokio blocking pool, and report back through a [`WorkerHandle`].

mod latency;

pub use self::latency::Latency;

use crate::channel::{
    api::BoundedChannel,
    cancel::CancelToken,
    condition::Coordination,
    core::Entry,
    error::PutError,
};
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::{
    any::Any,
    fmt::{self, Display, Formatter},
    io,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    thread,
    time::Instant,
};
use thiserror::Error;
use tokio::{
    runtime::{Handle, Runtime},
    sync::oneshot,
};


// mixed into the spawner seed per worker, so seeded workers draw distinct latency sequences.
const SEED_STRIDE: u64 = 0x9e3779b97f4a7c15;


/// A produced message
///
/// Immutable once created. The body is the text `Msg-<seq>-from-<origin>`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Message {
    origin: Arc<str>,
    seq: u64,
    body: String,
}

impl Message {
    /// Construct the `seq`th message (counting from 1) of the producer named `origin`
    pub fn new(origin: impl Into<Arc<str>>, seq: u64) -> Self {
        let origin = origin.into();
        let body = format!("Msg-{}-from-{}", seq, origin);
        Message { origin, seq, body }
    }

    /// Name of the producer that created this message
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Position of this message in its producer's stream, counting from 1
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Text of this message, `Msg-<seq>-from-<origin>`
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Identity of this message, without the body
    pub fn id(&self) -> MessageId {
        MessageId { origin: Arc::clone(&self.origin), seq: self.seq }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.body)
    }
}

/// Identifies a message by its producer and position in that producer's stream
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId {
    pub origin: Arc<str>,
    pub seq: u64,
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Msg-{}-from-{}", self.seq, self.origin)
    }
}

/// What a worker does
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        })
    }
}

/// When a consumer stops
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConsumerStop {
    /// Upon dequeuing a sentinel
    Sentinel,
    /// After consuming this many payloads, or upon dequeuing a sentinel if that comes first
    ///
    /// Quota consumers are not sent sentinels at shutdown. Mixing quota and sentinel consumers
    /// on one channel lets a quota consumer swallow a sentinel meant for another consumer.
    Quota(u64),
}

/// Why a worker stopped
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WorkerExit {
    /// A producer put all its messages
    Finished,
    /// A consumer dequeued a sentinel
    Sentinel,
    /// A consumer reached its quota
    Quota,
    /// The worker's cancel token was cancelled
    Cancelled,
}

/// What a worker did, reported when it stops
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub name: String,
    pub role: Role,
    /// Messages successfully put
    pub produced: u64,
    /// Payloads taken. Sentinels never count.
    pub consumed: u64,
    /// Payloads taken, in the order taken
    pub received: Vec<MessageId>,
    pub exit: WorkerExit,
}

impl WorkerReport {
    fn new(name: &str, role: Role) -> Self {
        WorkerReport {
            name: name.to_owned(),
            role,
            produced: 0,
            consumed: 0,
            received: Vec::new(),
            exit: WorkerExit::Finished,
        }
    }
}

/// Where workers run
#[derive(Debug, Clone)]
pub enum Substrate {
    /// One named OS thread per worker
    Threads,
    /// The blocking pool of a tokio runtime
    ///
    /// Every worker occupies one blocking thread for its whole life, so the runtime's
    /// `max_blocking_threads` must be at least the number of workers alive at once. Otherwise
    /// queued workers can wait forever on workers that are parked in the channel.
    Pool(Handle),
}

/// Error for failing to start a worker
#[derive(Error, Debug)]
#[error("failed to spawn worker {name}")]
pub struct SpawnError {
    pub name: String,
    #[source]
    pub source: io::Error,
}

/// Why joining a worker did not yield its report
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub(crate) enum JoinFailure {
    #[error("timed out")]
    TimedOut,
    #[error("panicked: {0}")]
    Panicked(String),
}

/// Spawns producer and consumer workers onto one channel
pub struct Spawner<C: Coordination> {
    channel: BoundedChannel<Message, C>,
    substrate: Substrate,
    producer_latency: Latency,
    consumer_latency: Latency,
    seed: Option<u64>,
    spawned: AtomicU64,
}

impl<C: Coordination> Spawner<C> {
    /// Construct with zero latency and unseeded randomness
    pub fn new(channel: BoundedChannel<Message, C>, substrate: Substrate) -> Self {
        Spawner {
            channel,
            substrate,
            producer_latency: Latency::ZERO,
            consumer_latency: Latency::ZERO,
            seed: None,
            spawned: AtomicU64::new(0),
        }
    }

    /// Set the simulated work time of producers and consumers
    pub fn with_latency(mut self, producer: Latency, consumer: Latency) -> Self {
        self.producer_latency = producer;
        self.consumer_latency = consumer;
        self
    }

    /// Seed the latency randomness, making each worker's sleep sequence reproducible
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// The channel workers are spawned onto
    pub fn channel(&self) -> &BoundedChannel<Message, C> {
        &self.channel
    }

    /// Spawn a producer that puts `count` messages and then stops
    pub fn spawn_producer(
        &self,
        name: impl Into<String>,
        count: u64,
    ) -> Result<WorkerHandle, SpawnError> {
        let ctx = self.context(name.into(), self.producer_latency);
        self.spawn(ctx, Role::Producer, None, move |ctx| produce(ctx, count))
    }

    /// Spawn a consumer that stops upon dequeuing a sentinel
    pub fn spawn_consumer(&self, name: impl Into<String>) -> Result<WorkerHandle, SpawnError> {
        self.spawn_consumer_with(name, ConsumerStop::Sentinel)
    }

    /// Spawn a consumer with the given stop policy
    pub fn spawn_consumer_with(
        &self,
        name: impl Into<String>,
        stop: ConsumerStop,
    ) -> Result<WorkerHandle, SpawnError> {
        let ctx = self.context(name.into(), self.consumer_latency);
        self.spawn(ctx, Role::Consumer, Some(stop), move |ctx| consume(ctx, stop))
    }

    fn context(&self, name: String, latency: Latency) -> Ctx<C> {
        let idx = self.spawned.fetch_add(1, Relaxed);
        let rng = match self.seed {
            Some(seed) => {
                Pcg32::seed_from_u64(seed ^ idx.wrapping_add(1).wrapping_mul(SEED_STRIDE))
            }
            None => Pcg32::from_entropy(),
        };
        Ctx {
            name,
            channel: self.channel.clone(),
            cancel: CancelToken::new(),
            latency,
            rng,
        }
    }

    fn spawn<F>(
        &self,
        ctx: Ctx<C>,
        role: Role,
        stop: Option<ConsumerStop>,
        body: F,
    ) -> Result<WorkerHandle, SpawnError>
    where
        F: FnOnce(&mut Ctx<C>) -> WorkerReport + Send + 'static,
    {
        let name = ctx.name.clone();
        let cancel = ctx.cancel.clone();
        let (send_report, done) = oneshot::channel();
        let run = move || {
            let mut ctx = ctx;
            let span = info_span!("worker", name = %ctx.name, %role);
            let report = span.in_scope(|| body(&mut ctx));
            // err if the handle was dropped
            let _ = send_report.send(report);
        };
        let joiner = match &self.substrate {
            Substrate::Threads => {
                let thread = thread::Builder::new()
                    .name(name.clone())
                    .spawn(run)
                    .map_err(|source| SpawnError { name: name.clone(), source })?;
                Joiner::Thread(Some(thread))
            }
            Substrate::Pool(handle) => {
                Joiner::Task(Some(handle.spawn_blocking(run)), handle.clone())
            }
        };
        debug!(worker = %name, %role, "spawned");
        Ok(WorkerHandle { name, role, stop, cancel, done, joiner })
    }
}

// everything a running worker owns.
struct Ctx<C: Coordination> {
    name: String,
    channel: BoundedChannel<Message, C>,
    cancel: CancelToken,
    latency: Latency,
    rng: Pcg32,
}

impl<C: Coordination> Ctx<C> {
    // sleep a random latency. errs if cancelled meanwhile.
    fn work(&mut self) -> Result<(), ()> {
        let dur = self.latency.sample(&mut self.rng);
        if dur.is_zero() {
            return if self.cancel.is_cancelled() { Err(()) } else { Ok(()) };
        }
        self.cancel.sleep(dur).map_err(|_| ())
    }
}

fn produce<C: Coordination>(ctx: &mut Ctx<C>, count: u64) -> WorkerReport {
    let mut report = WorkerReport::new(&ctx.name, Role::Producer);
    let origin: Arc<str> = Arc::from(ctx.name.as_str());
    let capacity = ctx.channel.capacity();
    for seq in 1..=count {
        if ctx.cancel.is_cancelled() {
            report.exit = WorkerExit::Cancelled;
            break;
        }
        let msg = Message::new(Arc::clone(&origin), seq);
        let id = msg.id();

        // try first, purely to narrate the wait
        let put = match ctx.channel.try_put(msg) {
            Ok(()) => Ok(()),
            Err(PutError { msg, .. }) => {
                debug!(len = ctx.channel.size(), capacity, "buffer full, waiting");
                ctx.channel.put(msg, &ctx.cancel).map_err(drop)
            }
        };
        if put.is_err() {
            warn!(msg = %id, "interrupted while waiting to produce");
            report.exit = WorkerExit::Cancelled;
            break;
        }
        report.produced += 1;
        info!(msg = %id, len = ctx.channel.size(), capacity, "produced");

        if ctx.work().is_err() {
            warn!("interrupted while producing");
            report.exit = WorkerExit::Cancelled;
            break;
        }
    }
    if report.exit == WorkerExit::Finished {
        info!(produced = report.produced, "finished producing");
    }
    report
}

fn consume<C: Coordination>(ctx: &mut Ctx<C>, stop: ConsumerStop) -> WorkerReport {
    let mut report = WorkerReport::new(&ctx.name, Role::Consumer);
    let capacity = ctx.channel.capacity();
    loop {
        if let ConsumerStop::Quota(quota) = stop {
            if report.consumed >= quota {
                report.exit = WorkerExit::Quota;
                break;
            }
        }
        if ctx.cancel.is_cancelled() {
            report.exit = WorkerExit::Cancelled;
            break;
        }

        // try first, purely to narrate the wait
        let entry = match ctx.channel.try_take() {
            Ok(entry) => entry,
            Err(_) => {
                debug!("buffer empty, waiting");
                match ctx.channel.take(&ctx.cancel) {
                    Ok(entry) => entry,
                    Err(_) => {
                        warn!("interrupted while waiting to consume");
                        report.exit = WorkerExit::Cancelled;
                        break;
                    }
                }
            }
        };
        let msg = match entry {
            Entry::Sentinel => {
                info!("received sentinel, stopping");
                report.exit = WorkerExit::Sentinel;
                break;
            }
            Entry::Payload(msg) => msg,
        };
        report.consumed += 1;
        info!(msg = %msg, len = ctx.channel.size(), capacity, "consumed");
        report.received.push(msg.id());

        if ctx.work().is_err() {
            warn!("interrupted while consuming");
            report.exit = WorkerExit::Cancelled;
            break;
        }
    }
    info!(consumed = report.consumed, exit = ?report.exit, "finished consuming");
    report
}

/// Joinable handle to a running worker
pub struct WorkerHandle {
    name: String,
    role: Role,
    // None for producers.
    stop: Option<ConsumerStop>,
    cancel: CancelToken,
    done: oneshot::Receiver<WorkerReport>,
    joiner: Joiner,
}

enum Joiner {
    Thread(Option<thread::JoinHandle<()>>),
    // the handle lets the task be reaped from outside any runtime.
    Task(Option<tokio::task::JoinHandle<()>>, Handle),
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the shutdown protocol owes this worker a sentinel
    pub fn expects_sentinel(&self) -> bool {
        self.stop == Some(ConsumerStop::Sentinel)
    }

    /// Cancel this worker, waking it if it is blocked in the channel or sleeping
    ///
    /// The worker leaves the channel consistent and stops at its next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of this worker's cancel token, for cancelling it from elsewhere
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the worker stops and return its report
    ///
    /// Errs with the panic message if the worker panicked. Must not be called from within an
    /// async context.
    pub fn join(self) -> Result<WorkerReport, String> {
        let WorkerHandle { done, mut joiner, .. } = self;
        match done.blocking_recv() {
            Ok(report) => {
                joiner.reap();
                Ok(report)
            }
            Err(_) => Err(joiner.reap().unwrap_or_else(no_report)),
        }
    }

    // wait for the report until the deadline.
    //
    // may be called again after a timeout.
    pub(crate) fn join_until(
        &mut self,
        rt: &Runtime,
        deadline: Instant,
    ) -> Result<WorkerReport, JoinFailure> {
        let done = &mut self.done;
        let result = rt.block_on(async move {
            tokio::time::timeout_at(deadline.into(), done).await
        });
        match result {
            Err(_elapsed) => Err(JoinFailure::TimedOut),
            Ok(Ok(report)) => {
                self.joiner.reap();
                Ok(report)
            }
            Ok(Err(_)) => Err(JoinFailure::Panicked(
                self.joiner.reap().unwrap_or_else(no_report)
            )),
        }
    }
}

impl Joiner {
    // join the underlying thread or task, once it is known to have stopped. returns the panic
    // message if it panicked.
    fn reap(&mut self) -> Option<String> {
        match self {
            Joiner::Thread(thread) => thread.take()?.join().err().map(panic_message),
            Joiner::Task(task, handle) => {
                let e = handle.block_on(task.take()?).err()?;
                e.is_panic().then(|| panic_message(e.into_panic()))
            }
        }
    }
}

fn no_report() -> String {
    "worker exited without reporting".to_owned()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::condition::SplitCondition;
    use std::time::Duration;

    fn spawner(capacity: usize, substrate: Substrate) -> Spawner<SplitCondition> {
        Spawner::new(BoundedChannel::new(capacity).unwrap(), substrate).with_seed(Some(0))
    }

    #[test]
    fn message_display() {
        let msg = Message::new("Producer-1", 3);
        assert_eq!(msg.to_string(), "Msg-3-from-Producer-1");
        assert_eq!(msg.id().to_string(), msg.body());
        assert_eq!(msg.origin(), "Producer-1");
    }

    #[test]
    fn producer_and_consumer_on_threads() {
        let spawner = spawner(2, Substrate::Threads);
        let producer = spawner.spawn_producer("Producer-1", 10).unwrap();
        let consumer = spawner.spawn_consumer("Consumer-1").unwrap();
        assert!(!producer.expects_sentinel());
        assert!(consumer.expects_sentinel());

        let produced = producer.join().unwrap();
        assert_eq!(produced.produced, 10);
        assert_eq!(produced.exit, WorkerExit::Finished);

        spawner.channel().put_sentinel(&CancelToken::new()).unwrap();
        let consumed = consumer.join().unwrap();
        assert_eq!(consumed.exit, WorkerExit::Sentinel);
        assert_eq!(consumed.consumed, 10);
        let seqs = consumed.received.iter().map(|id| id.seq).collect::<Vec<_>>();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        assert_eq!(spawner.channel().size(), 0);
    }

    #[test]
    fn quota_consumer_stops_without_sentinel() {
        let spawner = spawner(3, Substrate::Threads);
        let producer = spawner.spawn_producer("Producer-1", 4).unwrap();
        let consumer = spawner.spawn_consumer_with("Consumer-1", ConsumerStop::Quota(4)).unwrap();
        assert!(!consumer.expects_sentinel());
        assert_eq!(producer.join().unwrap().produced, 4);
        let report = consumer.join().unwrap();
        assert_eq!(report.exit, WorkerExit::Quota);
        assert_eq!(report.consumed, 4);
    }

    #[test]
    fn cancel_wakes_blocked_consumer() {
        let spawner = spawner(1, Substrate::Threads);
        let consumer = spawner.spawn_consumer("Consumer-1").unwrap();
        thread::sleep(Duration::from_millis(50));
        consumer.cancel();
        let report = consumer.join().unwrap();
        assert_eq!(report.exit, WorkerExit::Cancelled);
        assert_eq!(report.consumed, 0);
    }

    #[test]
    fn cancel_wakes_sleeping_producer() {
        let spawner = spawner(4, Substrate::Threads)
            .with_latency(Latency::millis(60_000, 60_000), Latency::ZERO);
        let producer = spawner.spawn_producer("Producer-1", 3).unwrap();
        thread::sleep(Duration::from_millis(50));
        producer.cancel();
        let report = producer.join().unwrap();
        assert_eq!(report.exit, WorkerExit::Cancelled);
        assert_eq!(report.produced, 1);
        assert_eq!(spawner.channel().size(), 1);
    }

    #[test]
    fn workers_on_blocking_pool() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(4)
            .enable_time()
            .build()
            .unwrap();
        let spawner = spawner(1, Substrate::Pool(rt.handle().clone()));
        let producers = (1..=2)
            .map(|i| spawner.spawn_producer(format!("Producer-{}", i), 5).unwrap())
            .collect::<Vec<_>>();
        let consumer = spawner.spawn_consumer("Consumer-1").unwrap();
        for producer in producers {
            assert_eq!(producer.join().unwrap().produced, 5);
        }
        spawner.channel().put_sentinel(&CancelToken::new()).unwrap();
        assert_eq!(consumer.join().unwrap().consumed, 10);
    }

    #[test]
    fn join_until_times_out_then_succeeds() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        let spawner = spawner(1, Substrate::Threads);
        let mut consumer = spawner.spawn_consumer("Consumer-1").unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(consumer.join_until(&rt, deadline).unwrap_err(), JoinFailure::TimedOut);
        consumer.cancel();
        let deadline = Instant::now() + Duration::from_secs(10);
        assert_eq!(consumer.join_until(&rt, deadline).unwrap().exit, WorkerExit::Cancelled);
    }

    #[test]
    fn panicking_thread_worker_joins_with_message() {
        let spawner = spawner(1, Substrate::Threads);
        let ctx = spawner.context("Producer-1".to_owned(), Latency::ZERO);
        let handle = spawner
            .spawn(ctx, Role::Producer, None, |_| panic!("producer blew up"))
            .unwrap();
        assert_eq!(handle.join().unwrap_err(), "producer blew up");
    }

    #[test]
    fn panicking_pool_worker_joins_with_message() {
        let pool = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        let spawner = spawner(1, Substrate::Pool(pool.handle().clone()));

        let ctx = spawner.context("Consumer-1".to_owned(), Latency::ZERO);
        let handle = spawner
            .spawn(ctx, Role::Consumer, None, |_| panic!("consumer blew up"))
            .unwrap();
        assert_eq!(handle.join().unwrap_err(), "consumer blew up");

        let ctx = spawner.context("Consumer-2".to_owned(), Latency::ZERO);
        let mut handle = spawner
            .spawn(ctx, Role::Consumer, None, |_| panic!("consumer blew up again"))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        assert_eq!(
            handle.join_until(&rt, deadline).unwrap_err(),
            JoinFailure::Panicked("consumer blew up again".to_owned()),
        );
    }

    #[test]
    fn panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }
}
