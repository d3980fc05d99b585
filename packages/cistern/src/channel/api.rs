// exposed API of channels

use super::{
    cancel::CancelToken,
    condition::{Coordination, Mode, SplitCondition, Timeout},
    core::{self, ChannelStats, Entry, Receipt},
    error::*,
};
use std::{
    fmt::{self, Formatter, Debug},
    time::Instant,
};


// ==== helper functions for adapting core API to exposed API ====


// log a committed operation, after the lock has been released.
fn log_receipt(op: &'static str, receipt: Receipt, capacity: usize) {
    if receipt.waits > 0 {
        trace!(op, waits = receipt.waits, len = receipt.len, capacity, "committed after waiting");
    } else {
        trace!(op, len = receipt.len, capacity, "committed");
    }
}

// narrow a compound wait error down to cancellation, for operations that never time out.
fn only_cancelled(e: TryWaitError) -> CancelledWait {
    match e {
        TryWaitError::Cancelled(e) => e,
        TryWaitError::WouldBlock(_) => unreachable!("WouldBlock with Timeout::Never"),
    }
}


// ==== the exposed API ====


/// Fixed-capacity FIFO channel with blocking put and take
///
/// Entries are delivered in the order their puts committed. At most `capacity` entries are ever
/// buffered. Handles are cheap to clone and all clones refer to the same channel.
///
/// The coordination strategy is chosen by the `C` parameter: [`SplitCondition`] (the default)
/// or [`BroadcastCondition`](crate::BroadcastCondition). Both give the same guarantees.
///
/// Every blocking operation takes a [`CancelToken`]. Cancelling it wakes the operation promptly,
/// which then fails without having changed the channel.
pub struct BoundedChannel<T, C = SplitCondition>(core::Channel<T, C>);

impl<T: Send + 'static, C: Coordination> BoundedChannel<T, C> {
    /// Construct an empty channel holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self, InvalidCapacity> {
        if capacity == 0 {
            return Err(InvalidCapacity);
        }
        Ok(BoundedChannel(core::Channel::new(capacity)))
    }

    /// Put a message, blocking while the channel is full
    ///
    /// Errors only if `cancel` is cancelled while this is blocked, in which case the message is
    /// handed back and nothing was enqueued.
    pub fn put(&self, msg: T, cancel: &CancelToken) -> Result<(), PutError<T, CancelledWait>> {
        self.put_payload(msg, Timeout::Never, cancel)
            .map_err(|PutError { msg, cause }| PutError { msg, cause: only_cancelled(cause) })
    }

    /// Put a message if it can be done without blocking
    pub fn try_put(&self, msg: T) -> Result<(), PutError<T, TryWaitError>> {
        self.put_payload(msg, Timeout::NonBlocking, &CancelToken::new())
    }

    /// Put a message, blocking while the channel is full but no later than `deadline`
    pub fn put_deadline(
        &self,
        msg: T,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<(), PutError<T, TryWaitError>> {
        self.put_payload(msg, Timeout::At(deadline), cancel)
    }

    /// Put a termination sentinel, blocking while the channel is full
    ///
    /// Sentinels obey capacity and ordering exactly like payloads.
    pub fn put_sentinel(&self, cancel: &CancelToken) -> Result<(), CancelledWait> {
        self.put_entry(Entry::Sentinel, Timeout::Never, cancel)
            .map_err(|(_, e)| only_cancelled(e))
    }

    /// Put a termination sentinel, blocking while the channel is full but no later than
    /// `deadline`
    pub fn put_sentinel_deadline(
        &self,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<(), TryWaitError> {
        self.put_entry(Entry::Sentinel, Timeout::At(deadline), cancel)
            .map_err(|(_, e)| e)
    }

    fn put_payload(
        &self,
        msg: T,
        timeout: Timeout,
        cancel: &CancelToken,
    ) -> Result<(), PutError<T, TryWaitError>> {
        self.put_entry(Entry::Payload(msg), timeout, cancel)
            .map_err(|(entry, cause)| match entry {
                Entry::Payload(msg) => PutError { msg, cause },
                Entry::Sentinel => unreachable!("payload put handed back a sentinel"),
            })
    }

    // enqueue and log. hands the entry back on failure.
    fn put_entry(
        &self,
        entry: Entry<T>,
        timeout: Timeout,
        cancel: &CancelToken,
    ) -> Result<(), (Entry<T>, TryWaitError)> {
        match self.0.enqueue(entry, timeout, cancel) {
            Ok(receipt) => {
                log_receipt("put", receipt, self.capacity());
                Ok(())
            }
            Err((entry, e)) => {
                if e.is_cancelled() {
                    debug!("put cancelled while waiting for space");
                }
                Err((entry, e))
            }
        }
    }

    /// Take the front entry, blocking while the channel is empty
    ///
    /// If this returns [`Entry::Sentinel`], the caller must stop consuming. Errors only if
    /// `cancel` is cancelled while this is blocked, in which case nothing was dequeued.
    pub fn take(&self, cancel: &CancelToken) -> Result<Entry<T>, CancelledWait> {
        self.take_entry(Timeout::Never, cancel).map_err(only_cancelled)
    }

    /// Take the front entry if it can be done without blocking
    pub fn try_take(&self) -> Result<Entry<T>, TryWaitError> {
        self.take_entry(Timeout::NonBlocking, &CancelToken::new())
    }

    /// Take the front entry, blocking while the channel is empty but no later than `deadline`
    pub fn take_deadline(
        &self,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Entry<T>, TryWaitError> {
        self.take_entry(Timeout::At(deadline), cancel)
    }

    fn take_entry(&self, timeout: Timeout, cancel: &CancelToken) -> Result<Entry<T>, TryWaitError> {
        match self.0.dequeue(timeout, cancel) {
            Ok((entry, receipt)) => {
                log_receipt("take", receipt, self.capacity());
                Ok(entry)
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!("take cancelled while waiting for an entry");
                }
                Err(e)
            }
        }
    }
}

impl<T, C: Coordination> BoundedChannel<T, C> {
    /// Number of buffered entries, sentinels included
    ///
    /// This is a snapshot that may be stale by the time it is read. Use it for diagnostics only,
    /// never to decide whether to put or take.
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Maximum number of buffered entries
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }

    /// Snapshot of this channel's counters
    pub fn stats(&self) -> ChannelStats {
        self.0.stats()
    }

    /// The coordination strategy this channel uses
    pub fn mode(&self) -> Mode {
        C::MODE
    }
}

impl<T, C: Coordination> Clone for BoundedChannel<T, C> {
    fn clone(&self) -> Self {
        BoundedChannel(self.0.clone())
    }
}

impl<T, C: Coordination> Debug for BoundedChannel<T, C> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("mode", &C::MODE)
            .field("stats", &self.stats())
            .finish()
    }
}


// ==== tests ====
