// channel error types.

use thiserror::Error;


// ==== base error types ====


/// Error for a blocking put or take whose wait was interrupted by its [`CancelToken`]
///
/// The channel is left exactly as it was before the call: a cancelled put enqueued nothing and a
/// cancelled take dequeued nothing.
///
/// [`CancelToken`]: crate::CancelToken
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("blocking wait was cancelled")]
pub struct CancelledWait;

/// Error for attempting to use a channel with no or limited blocking, and the operation not
/// completing immediately or by the specified deadline
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("operation could not complete without blocking past its deadline")]
pub struct WouldBlockError;

/// Error for constructing a channel with a capacity of zero
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("channel capacity must be at least 1")]
pub struct InvalidCapacity;


// ==== compound error types ====


/// Error for trying to put into a channel
///
/// The message is handed back rather than dropped, so the caller may retry or dispose of it.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("put failed: {cause}")]
pub struct PutError<T, E> {
    /// The message that could not be put
    pub msg: T,
    /// The reason the message could not be put
    pub cause: E,
}

macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Reason a put or take with no or limited blocking did not complete
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TryWaitError {
    /// The wait was interrupted by its cancel token
    #[error(transparent)]
    Cancelled(CancelledWait),
    /// The operation could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TryWaitError {
    Cancelled(CancelledWait),
    WouldBlock(WouldBlockError),
});

impl TryWaitError {
    /// Whether this is the cancellation case
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TryWaitError::Cancelled(_))
    }
}
