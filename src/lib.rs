//! reactor-pool: framed, compressed connections spread across a fixed pool
//! of selector controllers.
//!
//! - `codec`: pluggable payload compression (null, lz4)
//! - `frame`: length-prefixed wire framing around codec output
//! - `runtime`: controllers, the pool and its assignment strategies
//! - `server`: the acceptor feeding accepted sockets into the pool
//! - `config`: CLI arguments and TOML configuration file

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod runtime;
pub mod server;

pub use codec::{Codec, CodecKind, Compressor, Decompressor};
pub use config::Config;
pub use runtime::{AssignerStrategy, ControllerPool, MessageHandler};
pub use server::Acceptor;
