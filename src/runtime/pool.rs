//! Fixed pool of selector controllers.
//!
//! Accepting a channel is a two-step handoff: the configured assigner picks
//! a controller, then the channel is queued on that controller for
//! registration. The accepting thread never touches a controller's poll.
//!
//! A controller whose thread has exited (e.g. after a poll failure) is left
//! out of assignment while any other controller is still running.

use super::assigner::{ChannelInfo, ControllerAssigner};
use super::controller::{
    ConnectionHandle, ControllerHandle, ControllerSettings, ControllerState, SelectorController,
};
use super::handler::MessageHandler;
use crate::codec::CodecKind;
use crate::error::PoolError;
use mio::net::TcpStream;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ControllerPool {
    controllers: Vec<ControllerHandle>,
    assigner: Box<dyn ControllerAssigner>,
    codec: CodecKind,
}

impl ControllerPool {
    /// Allocate `size` controllers in the `Created` state.
    ///
    /// Fails with `InvalidPoolSize` when `size` is zero and with
    /// `InvalidSetting` when a controller setting is zero.
    pub fn new(
        size: usize,
        assigner: Box<dyn ControllerAssigner>,
        codec: CodecKind,
        settings: ControllerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidPoolSize(size));
        }
        settings.validate()?;

        let controllers = (0..size)
            .map(|id| SelectorController::new(id, settings.clone(), Arc::clone(&handler)))
            .collect();

        Ok(Self {
            controllers,
            assigner,
            codec,
        })
    }

    /// Start every controller. On failure, controllers already started are
    /// shut down again.
    pub fn start(&self) -> Result<(), PoolError> {
        for controller in &self.controllers {
            if let Err(e) = controller.start() {
                self.shutdown();
                return Err(e);
            }
        }
        info!(
            controllers = self.controllers.len(),
            assigner = ?self.assigner,
            codec = %self.codec,
            "Controller pool started"
        );
        Ok(())
    }

    /// Hand a newly accepted channel to a controller using the pool's codec.
    pub fn accept_channel(&self, stream: TcpStream) -> Result<ConnectionHandle, PoolError> {
        self.accept_channel_with_codec(stream, self.codec)
    }

    /// Hand a channel to a controller with a codec negotiated for it.
    pub fn accept_channel_with_codec(
        &self,
        stream: TcpStream,
        codec: CodecKind,
    ) -> Result<ConnectionHandle, PoolError> {
        let candidate = ChannelInfo {
            peer: stream.peer_addr().ok(),
        };
        let running: Vec<ControllerHandle>;
        let eligible = if self.controllers.iter().all(|c| is_running(c)) {
            &self.controllers[..]
        } else {
            running = self
                .controllers
                .iter()
                .filter(|c| is_running(c))
                .cloned()
                .collect();
            if running.is_empty() {
                // Let the controller report why it refuses
                &self.controllers[..]
            } else {
                &running[..]
            }
        };
        let controller = self.assigner.assign(&candidate, eligible)?;
        let handle = controller.register(stream, codec.build())?;

        debug!(
            controller = controller.id(),
            conn_id = handle.id(),
            peer = ?candidate.peer,
            "Assigned channel"
        );
        Ok(handle)
    }

    pub fn controllers(&self) -> &[ControllerHandle] {
        &self.controllers
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Default codec for accepted channels.
    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Total connections across all controllers.
    pub fn connection_count(&self) -> usize {
        self.controllers.iter().map(|c| c.connection_count()).sum()
    }

    /// Shut down every controller. Idempotent.
    pub fn shutdown(&self) {
        for controller in &self.controllers {
            controller.shutdown();
        }
    }
}

fn is_running(controller: &ControllerHandle) -> bool {
    controller.state() == ControllerState::Running
}

impl Drop for ControllerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
