//! reactor-pool: echo server over a pool of selector controllers.
//!
//! Every accepted connection is placed on one controller by the configured
//! assigner and speaks length-prefixed frames through the configured codec.

use reactor_pool::runtime::{ControllerPool, EchoHandler};
use reactor_pool::{Acceptor, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        pool_size = config.pool_size,
        assigner = %config.assigner,
        codec = %config.codec,
        max_frame_size = config.controller.max_frame_size,
        "Starting reactor-pool server"
    );

    let addr: SocketAddr = config.listen.parse()?;

    let pool = ControllerPool::new(
        config.pool_size,
        config.assigner.build(),
        config.codec,
        config.controller.clone(),
        Arc::new(EchoHandler),
    )?;
    pool.start()?;
    let pool = Arc::new(pool);

    let acceptor = Acceptor::spawn(addr, Arc::clone(&pool))?;
    info!(addr = %acceptor.local_addr(), "Server ready");

    acceptor.join();
    pool.shutdown();
    Ok(())
}
