//! Server half of the bridge.
//!
//! Requests are decoded by axum handlers into a [`Request`], dispatched to a
//! [`Backend`](crate::backend::Backend), and translated back to wire form.
//! Process requests upgrade the connection and hand it to a [`ProcessSession`].

mod dispatch;
mod error;
mod http;
mod listener;
mod session;

pub use dispatch::{Dispatcher, Reply, Request};
pub use error::ApiError;
pub use http::routes;
pub use listener::{ServerConfig, serve, serve_on, shutdown_signal};
pub use session::{ProcessSession, STREAM_CLAIM_TIMEOUT, StreamRegistry, pump_stream};
