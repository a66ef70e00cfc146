//! Wire protocol: JSON request/response bodies and the process frame stream.

pub mod codec;
pub mod messages;
mod payload;

pub use codec::JsonCodec;
pub use messages::*;
pub use payload::{PayloadSource, ProcessInput, ProcessPayload, StreamId, StreamType};
