// implementation of the cistern channel.
//
// the basic architecture is the classic bounded buffer. it is as such:
//
// channel handles wrap around Arc<shared state>
//                                  |
//          /-----------------------/
//          v
//       shared state
//          |
//          |------ it contains a Mutex around a ring::Ring<Entry<T>>, a fixed-capacity,
//          |       not-itself-concurrent FIFO holding the buffered entries, plus the counters
//          |       reported by stats(). the mutex is the only lock, and is held only for O(1)
//          |       work: check predicate, push or pop, bump counters, signal.
//          |
//          \------ it contains a Coordination strategy: the condvar wait-set(s) bound to that
//                  mutex. BroadcastCondition has one wait-set for everyone, SplitCondition has
//                  separate "not full" and "not empty" wait-sets.
//
// blocked operations are cancellable through a CancelToken. a parked waiter registers its
// channel's shared state with the token as an interrupt hook, and cancelling the token wakes the
// whole wait-set so the waiter can observe the cancellation.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      ring<------------------core: Owns the shared state and the wait loop. Presents blocking
//                   |         ^     enqueue/dequeue with a timeout and a cancel token, reporting
//      condition<---|         |     what happened so the caller can log it outside the lock.
//                   |         |
//      cancel<------/         |
//                             |
//                             api: This is a wrapper around core that adapts it into an API that
//                                  is convenient and defensive. The crate re-exports this API
//                                  publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod cancel;
pub(crate) mod condition;
pub(crate) mod core;

mod ring;
