//! Reactor runtime.
//!
//! - `SelectorController`: one thread, one mio poll, a private set of
//!   connections.
//! - `ControllerPool`: N controllers plus an assigner that places each
//!   accepted channel on one of them.
//! - `Connection`: framing, codec and buffering for a single channel.
//! - `MessageHandler`: the protocol layer that consumes decoded payloads.

mod assigner;
mod connection;
mod controller;
mod handler;
mod pool;

pub use assigner::{
    AssignerStrategy, ChannelInfo, ControllerAssigner, LeastLoadedAssigner, RandomAssigner,
    RoundRobinAssigner,
};
pub use connection::{ConnState, Connection, ConnectionId, ReadOutcome, WriteStatus};
pub use controller::{
    ConnectionHandle, ControllerHandle, ControllerSettings, ControllerState, SelectorController,
};
pub use handler::{EchoHandler, MessageHandler};
pub use pool::ControllerPool;
