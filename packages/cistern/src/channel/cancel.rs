// cancellation tokens for blocking channel waits and worker sleeps.
//
// a wait that is about to park registers an interrupt hook with its token. cancelling the token
// flips the flag, then runs every registered hook. a hook locks the channel mutex before waking
// waiters, so a waiter that saw the flag unset while holding the mutex is guaranteed to already
// be parked by the time the hook's wake-up lands.
//
// lock order: channel mutex, then token mutex. `cancel` never holds the token mutex while running
// hooks, so it never takes them in the opposite order.

use super::error::CancelledWait;
use std::{
    fmt::{self, Formatter, Debug},
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
        Condvar,
        Mutex,
    },
    time::{Duration, Instant},
};


// something parked waits can be interrupted through.
pub(crate) trait Interrupt: Send + Sync {
    // wake every waiter, so each can observe its token's flag.
    fn interrupt(&self);
}

/// Handle for cancelling blocking channel operations and worker sleeps
///
/// Clones share the same state. Cancelling is idempotent and cannot be undone.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<Inner>);

#[derive(Default)]
struct Inner {
    // set once, never cleared. readable without locking.
    cancelled: AtomicBool,
    lockable: Mutex<Lockable>,
    // signalled on cancel, for `sleep`.
    sleepers: Condvar,
}

#[derive(Default)]
struct Lockable {
    cancelled: bool,
    next_hook_id: u64,
    hooks: Vec<(u64, Arc<dyn Interrupt>)>,
}

impl CancelToken {
    /// Construct a token that is not yet cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel, waking any wait or sleep currently running under this token
    pub fn cancel(&self) {
        self.0.cancelled.store(true, SeqCst);
        let hooks = {
            let mut lock = self.0.lockable.lock().unwrap();
            if lock.cancelled {
                return;
            }
            lock.cancelled = true;
            self.0.sleepers.notify_all();
            lock.hooks.iter().map(|(_, hook)| Arc::clone(hook)).collect::<Vec<_>>()
        };
        for hook in hooks {
            hook.interrupt();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called on this token or any clone of it
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(SeqCst)
    }

    /// Sleep for `dur`, returning early if cancelled
    ///
    /// Returns `Err` if the token was cancelled before or during the sleep.
    pub fn sleep(&self, dur: Duration) -> Result<(), CancelledWait> {
        let deadline = Instant::now() + dur;
        let mut lock = self.0.lockable.lock().unwrap();
        while !lock.cancelled {
            let Some(remaining) = deadline.checked_duration_since(Instant::now())
                else { return Ok(()) };
            if remaining.is_zero() {
                return Ok(());
            }
            lock = self.0.sleepers.wait_timeout(lock, remaining).unwrap().0;
        }
        Err(CancelledWait)
    }

    // register an interrupt hook for the lifetime of the returned guard.
    //
    // the caller must check `is_cancelled` after registering and before parking.
    pub(crate) fn park(&self, hook: Arc<dyn Interrupt>) -> Parked<'_> {
        let mut lock = self.0.lockable.lock().unwrap();
        let id = lock.next_hook_id;
        lock.next_hook_id += 1;
        lock.hooks.push((id, hook));
        Parked { token: self, id }
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// registration of an interrupt hook. unregisters when dropped.
pub(crate) struct Parked<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl<'a> Drop for Parked<'a> {
    fn drop(&mut self) {
        let mut lock = self.token.0.lockable.lock().unwrap();
        lock.hooks.retain(|&(id, _)| id != self.id);
    }
}
