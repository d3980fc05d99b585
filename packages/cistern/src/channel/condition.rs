// coordination strategies for the channel: how blocked puts and takes are parked and woken.
//
// both strategies park on std condition variables bound to the channel's one mutex, so the mutex
// is always released for the full duration of a wait. neither strategy promises that a woken
// waiter's predicate holds; the core re-checks in a loop after every wake.

use serde::Deserialize;
use std::{
    fmt::Debug,
    sync::{Condvar, MutexGuard},
    time::{Duration, Instant},
};


// which predicate a waiter is blocked on.
#[doc(hidden)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cond {
    // blocked in put because the channel is full.
    NotFull,
    // blocked in take because the channel is empty.
    NotEmpty,
}

// timeout for blocking on a channel operation.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the operation cannot complete without blocking.
    NonBlocking,
}

/// Which coordination strategy a channel uses
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One wait-set shared by producers and consumers, woken by broadcast on every state change
    Monitor,
    /// Two wait-sets, "not full" and "not empty", each woken only by the transition it awaits
    Split,
}

/// Synchronization substrate a [`BoundedChannel`](crate::BoundedChannel) parks its waiters on
///
/// Implementations must release the guarded mutex for the whole of any wait and must tolerate
/// being woken for a predicate that has not become true. This trait is sealed; pick one of
/// [`BroadcastCondition`] or [`SplitCondition`].
pub trait Coordination: sealed::Sealed + Default + Debug + Send + Sync + 'static {
    /// The strategy this type implements
    const MODE: Mode;

    #[doc(hidden)]
    fn wait<'a, L>(&self, guard: MutexGuard<'a, L>, cond: Cond) -> MutexGuard<'a, L>;

    #[doc(hidden)]
    fn wait_timeout<'a, L>(
        &self,
        guard: MutexGuard<'a, L>,
        cond: Cond,
        dur: Duration,
    ) -> MutexGuard<'a, L>;

    // wake waiters interested in `cond` after it may have become true. called with the mutex held.
    #[doc(hidden)]
    fn signal(&self, cond: Cond);

    // wake every waiter regardless of predicate. used to deliver cancellation.
    #[doc(hidden)]
    fn wake_all(&self);
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::BroadcastCondition {}
    impl Sealed for super::SplitCondition {}
}

/// Monitor-style coordination: a single wait-set, broadcast on every put and take
///
/// A put wakes blocked producers along with blocked consumers, and a take wakes blocked consumers
/// along with blocked producers, because one wait-set cannot tell them apart. Every over-woken
/// waiter re-checks and parks again. Correct under any contention, but not fair between
/// producers and consumers.
#[derive(Debug, Default)]
pub struct BroadcastCondition {
    waiters: Condvar,
}

impl Coordination for BroadcastCondition {
    const MODE: Mode = Mode::Monitor;

    fn wait<'a, L>(&self, guard: MutexGuard<'a, L>, _cond: Cond) -> MutexGuard<'a, L> {
        self.waiters.wait(guard).unwrap()
    }

    fn wait_timeout<'a, L>(
        &self,
        guard: MutexGuard<'a, L>,
        _cond: Cond,
        dur: Duration,
    ) -> MutexGuard<'a, L> {
        self.waiters.wait_timeout(guard, dur).unwrap().0
    }

    fn signal(&self, _cond: Cond) {
        self.waiters.notify_all();
    }

    fn wake_all(&self) {
        self.waiters.notify_all();
    }
}

/// Explicit-condition coordination: independent "not full" and "not empty" wait-sets on one lock
///
/// A put signals only `not_empty` and a take signals only `not_full`. All waiters of the signalled
/// set are woken, since several may compete for the one slot or entry that became available.
#[derive(Debug, Default)]
pub struct SplitCondition {
    not_full: Condvar,
    not_empty: Condvar,
}

impl SplitCondition {
    fn condvar(&self, cond: Cond) -> &Condvar {
        match cond {
            Cond::NotFull => &self.not_full,
            Cond::NotEmpty => &self.not_empty,
        }
    }
}

impl Coordination for SplitCondition {
    const MODE: Mode = Mode::Split;

    fn wait<'a, L>(&self, guard: MutexGuard<'a, L>, cond: Cond) -> MutexGuard<'a, L> {
        self.condvar(cond).wait(guard).unwrap()
    }

    fn wait_timeout<'a, L>(
        &self,
        guard: MutexGuard<'a, L>,
        cond: Cond,
        dur: Duration,
    ) -> MutexGuard<'a, L> {
        self.condvar(cond).wait_timeout(guard, dur).unwrap().0
    }

    fn signal(&self, cond: Cond) {
        self.condvar(cond).notify_all();
    }

    fn wake_all(&self) {
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}
