// minimal safe core of the channel. the exposed API is a convenience wrapper around this.

use super::{
    cancel::{CancelToken, Interrupt, Parked},
    condition::{Cond, Coordination, Timeout},
    error::{CancelledWait, WouldBlockError, TryWaitError},
    ring::Ring,
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};


/// Entry of a channel: either a payload or a termination sentinel
///
/// A sentinel is a distinct variant rather than a reserved payload value, so no payload can ever
/// be mistaken for one.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Entry<T> {
    /// A regular message
    Payload(T),
    /// Tells the consumer that dequeues it to stop consuming
    Sentinel,
}

impl<T> Entry<T> {
    /// Whether this is [`Entry::Sentinel`]
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Entry::Sentinel)
    }

    /// Convert into the payload, or `None` for a sentinel
    pub fn into_payload(self) -> Option<T> {
        match self {
            Entry::Payload(msg) => Some(msg),
            Entry::Sentinel => None,
        }
    }
}

/// Snapshot of a channel's counters
///
/// All counters are updated under the channel's lock, so one snapshot is internally consistent.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ChannelStats {
    /// Fixed maximum number of buffered entries
    pub capacity: usize,
    /// Number of buffered entries, sentinels included
    pub len: usize,
    /// Greatest `len` ever observed
    pub high_water: usize,
    /// Successful payload puts
    pub puts: u64,
    /// Successful payload takes
    pub takes: u64,
    /// Successful sentinel puts
    pub sentinels_put: u64,
    /// Successful sentinel takes
    pub sentinels_taken: u64,
    /// Times a put parked because the channel was full
    pub full_waits: u64,
    /// Times a take parked because the channel was empty
    pub empty_waits: u64,
    /// Times a parked waiter woke to find its predicate still false
    pub futile_wakeups: u64,
    /// Blocking puts and takes abandoned because their token was cancelled
    pub cancelled_waits: u64,
}


// handle to a channel.
pub(crate) struct Channel<T, C>(Arc<Shared<T, C>>);

// channel shared state.
struct Shared<T, C> {
    // mutex around lockable state. guards the ring and every counter.
    lockable: Mutex<Lockable<T>>,
    // wait-sets bound to `lockable`.
    coord: C,
    // fixed at construction, so readable without locking.
    capacity: usize,
}

// channel lockable state.
struct Lockable<T> {
    // storage for entries. its capacity is the channel bound.
    entries: Ring<Entry<T>>,
    stats: ChannelStats,
}

// what a completed put or take did, reported back so the caller can log it after unlocking.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Receipt {
    // buffered entries right after the operation committed.
    pub(crate) len: usize,
    // times the operation parked before committing.
    pub(crate) waits: u32,
}

impl<T, C: Coordination> Channel<T, C> {
    // construct empty channel with the given capacity.
    //
    // panics if capacity is 0.
    pub(crate) fn new(capacity: usize) -> Self {
        Channel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                entries: Ring::with_capacity(capacity),
                stats: ChannelStats { capacity, ..Default::default() },
            }),
            coord: C::default(),
            capacity,
        }))
    }

    // clone another handle to the channel.
    pub(crate) fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }

    // lock the channel.
    fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        self.0.lockable.lock().unwrap()
    }

    // snapshot the counters.
    pub(crate) fn stats(&self) -> ChannelStats {
        let lock = self.lock();
        ChannelStats { len: lock.entries.len(), ..lock.stats }
    }

    // number of buffered entries.
    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.0.capacity
    }
}

impl<T: Send + 'static, C: Coordination> Channel<T, C> {
    // append an entry, blocking while full.
    //
    // on failure, hands the entry back and leaves the channel unchanged.
    pub(crate) fn enqueue(
        &self,
        entry: Entry<T>,
        timeout: Timeout,
        cancel: &CancelToken,
    ) -> Result<Receipt, (Entry<T>, TryWaitError)> {
        let mut lock = self.lock();
        let mut parked = None;
        let mut waits = 0;
        let mut lock = loop {
            // predicate re-checked after every wake, whoever caused it
            if !lock.entries.is_full() {
                break lock;
            }
            if let Err(e) = self.park(&mut lock, &mut parked, timeout, cancel) {
                return Err((entry, e));
            }
            lock.stats.full_waits += 1;
            waits += 1;
            lock = self.wait(lock, Cond::NotFull, timeout);
            if cancel.is_cancelled() {
                lock.stats.cancelled_waits += 1;
                return Err((entry, CancelledWait.into()));
            }
            if lock.entries.is_full() && !expired(timeout) {
                lock.stats.futile_wakeups += 1;
            }
        };

        let is_sentinel = entry.is_sentinel();
        assert!(lock.entries.push(entry).is_ok(), "capacity violation on put (internal bug)");
        if is_sentinel {
            lock.stats.sentinels_put += 1;
        } else {
            lock.stats.puts += 1;
        }
        let len = lock.entries.len();
        lock.stats.high_water = lock.stats.high_water.max(len);
        self.0.coord.signal(Cond::NotEmpty);
        drop(lock);
        drop(parked);
        Ok(Receipt { len, waits })
    }

    // remove the front entry, blocking while empty.
    //
    // on failure, leaves the channel unchanged.
    pub(crate) fn dequeue(
        &self,
        timeout: Timeout,
        cancel: &CancelToken,
    ) -> Result<(Entry<T>, Receipt), TryWaitError> {
        let mut lock = self.lock();
        let mut parked = None;
        let mut waits = 0;
        let mut lock = loop {
            if !lock.entries.is_empty() {
                break lock;
            }
            self.park(&mut lock, &mut parked, timeout, cancel)?;
            lock.stats.empty_waits += 1;
            waits += 1;
            lock = self.wait(lock, Cond::NotEmpty, timeout);
            if cancel.is_cancelled() {
                lock.stats.cancelled_waits += 1;
                return Err(CancelledWait.into());
            }
            if lock.entries.is_empty() && !expired(timeout) {
                lock.stats.futile_wakeups += 1;
            }
        };

        let Some(entry) = lock.entries.pop()
            else { unreachable!("capacity violation on take (internal bug)") };
        if entry.is_sentinel() {
            lock.stats.sentinels_taken += 1;
        } else {
            lock.stats.takes += 1;
        }
        let len = lock.entries.len();
        self.0.coord.signal(Cond::NotFull);
        drop(lock);
        drop(parked);
        Ok((entry, Receipt { len, waits }))
    }

    // decide whether the caller may park, registering with the cancel token on the first park.
    //
    // returns err if the caller must give up instead: the timeout is non-blocking, the deadline
    // already passed, or it was cancelled.
    fn park<'a>(
        &self,
        lock: &mut MutexGuard<'_, Lockable<T>>,
        parked: &mut Option<Parked<'a>>,
        timeout: Timeout,
        cancel: &'a CancelToken,
    ) -> Result<(), TryWaitError> {
        if expired(timeout) {
            return Err(WouldBlockError.into());
        }
        if parked.is_none() {
            let hook: Arc<dyn Interrupt> = self.0.clone();
            *parked = Some(cancel.park(hook));
        }
        // checked after registering, so a concurrent cancel either is seen here or wakes us
        if cancel.is_cancelled() {
            lock.stats.cancelled_waits += 1;
            return Err(CancelledWait.into());
        }
        Ok(())
    }

    // park until woken or the deadline passes. the caller re-checks its predicate either way.
    fn wait<'a>(
        &self,
        lock: MutexGuard<'a, Lockable<T>>,
        cond: Cond,
        timeout: Timeout,
    ) -> MutexGuard<'a, Lockable<T>> {
        match timeout {
            Timeout::Never => self.0.coord.wait(lock, cond),
            Timeout::At(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(dur) => self.0.coord.wait_timeout(lock, cond, dur),
                None => lock,
            },
            Timeout::NonBlocking => lock,
        }
    }
}

// whether a timeout no longer permits blocking.
fn expired(timeout: Timeout) -> bool {
    match timeout {
        Timeout::Never => false,
        Timeout::At(deadline) => Instant::now() >= deadline,
        Timeout::NonBlocking => true,
    }
}

impl<T: Send, C: Coordination> Interrupt for Shared<T, C> {
    fn interrupt(&self) {
        // taking the lock orders this wake-up after any waiter that checked its token under it
        let _lock = self.lockable.lock().unwrap();
        self.coord.wake_all();
    }
}
