//! Client half of the bridge.

mod connection;
mod error;
mod process;
mod stream_handler;

pub use connection::{Connection, ConnectionConfig, Hijacked, OutputMode, parse_env};
pub use error::{Error, Result};
pub use process::{Process, ProcessIo};
pub use stream_handler::{Sink, StreamHandler};
