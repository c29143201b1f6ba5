//! Strategies for choosing which controller receives a new channel.
//!
//! An assigner only *chooses*; the pool commits the choice by calling
//! `register` on the returned controller. Keeping the two steps apart leaves
//! strategies free of side effects on the controllers themselves.

use super::controller::ControllerHandle;
use crate::error::PoolError;
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What an assigner may know about the channel being placed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelInfo {
    pub peer: Option<SocketAddr>,
}

/// Picks one controller from the pool for a newly accepted channel.
///
/// Implementations must return a member of `controllers` and fail with
/// `PoolError::EmptyPool` when it is empty. They may be called concurrently
/// from several acceptor threads.
pub trait ControllerAssigner: Send + Sync + fmt::Debug {
    fn assign(
        &self,
        candidate: &ChannelInfo,
        controllers: &[ControllerHandle],
    ) -> Result<ControllerHandle, PoolError>;
}

/// Uniformly random choice, independent across calls.
#[derive(Debug, Default)]
pub struct RandomAssigner;

impl ControllerAssigner for RandomAssigner {
    fn assign(
        &self,
        _candidate: &ChannelInfo,
        controllers: &[ControllerHandle],
    ) -> Result<ControllerHandle, PoolError> {
        if controllers.is_empty() {
            return Err(PoolError::EmptyPool);
        }
        // thread_rng is thread-local, so concurrent acceptors never contend
        let index = rand::thread_rng().gen_range(0..controllers.len());
        Ok(controllers[index].clone())
    }
}

/// Cycles through controllers in order.
#[derive(Debug, Default)]
pub struct RoundRobinAssigner {
    next: AtomicUsize,
}

impl ControllerAssigner for RoundRobinAssigner {
    fn assign(
        &self,
        _candidate: &ChannelInfo,
        controllers: &[ControllerHandle],
    ) -> Result<ControllerHandle, PoolError> {
        if controllers.is_empty() {
            return Err(PoolError::EmptyPool);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % controllers.len();
        Ok(controllers[index].clone())
    }
}

/// Controller with the fewest connections, lowest index on ties.
#[derive(Debug, Default)]
pub struct LeastLoadedAssigner;

impl ControllerAssigner for LeastLoadedAssigner {
    fn assign(
        &self,
        _candidate: &ChannelInfo,
        controllers: &[ControllerHandle],
    ) -> Result<ControllerHandle, PoolError> {
        controllers
            .iter()
            .enumerate()
            .min_by_key(|(index, controller)| (controller.connection_count(), *index))
            .map(|(_, controller)| controller.clone())
            .ok_or(PoolError::EmptyPool)
    }
}

/// Configurable assignment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AssignerStrategy {
    #[default]
    Random,
    RoundRobin,
    LeastLoaded,
}

impl AssignerStrategy {
    pub fn build(self) -> Box<dyn ControllerAssigner> {
        match self {
            AssignerStrategy::Random => Box::new(RandomAssigner),
            AssignerStrategy::RoundRobin => Box::<RoundRobinAssigner>::default(),
            AssignerStrategy::LeastLoaded => Box::new(LeastLoadedAssigner),
        }
    }
}

impl fmt::Display for AssignerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignerStrategy::Random => f.write_str("random"),
            AssignerStrategy::RoundRobin => f.write_str("round-robin"),
            AssignerStrategy::LeastLoaded => f.write_str("least-loaded"),
        }
    }
}
