//! warden-bridge: client and server for a remote container-management API.
//!
//! The client turns container operations into HTTP requests; the server
//! decodes them and calls a [`Backend`]. Process I/O runs over hijacked
//! connections carrying length-delimited JSON frames.

pub mod backend;
pub mod bomberman;
pub mod client;
pub mod protocol;
pub mod routes;
pub mod server;
pub mod translate;

pub use backend::{Backend, BackendError, Container};
pub use bomberman::{Bomberman, EvictionScheduler, PauseGuard};
pub use client::{Connection, ConnectionConfig, OutputMode, Process, ProcessIo};
pub use routes::RouteName;
pub use server::{ServerConfig, serve, serve_on};
