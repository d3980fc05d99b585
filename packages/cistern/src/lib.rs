//! Bounded blocking channel for producer/consumer coordination, with sentinel-based shutdown.
//!
//! The core is [`BoundedChannel`], a fixed-capacity FIFO whose `put` blocks while it is full and
//! whose `take` blocks while it is empty. It is generic over a [`Coordination`] strategy:
//!
//! - [`BroadcastCondition`], monitor-style: one wait-set, broadcast on every change.
//! - [`SplitCondition`]: separate "not full" and "not empty" wait-sets.
//!
//! Around it, [`worker`] spawns simulated producers and consumers, [`shutdown`] terminates them in
//! order by enqueuing one [`Entry::Sentinel`] per consumer, and [`sim`] ties it together from a
//! [`config::SimConfig`].

#[macro_use]
extern crate tracing;

mod channel;
pub mod worker;
pub mod shutdown;
pub mod config;
pub mod sim;

pub use crate::channel::{
    api::*,
    cancel::CancelToken,
    condition::{BroadcastCondition, Coordination, Mode, SplitCondition},
    core::{ChannelStats, Entry},
};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}
