//! Length-prefixed JSON frames for hijacked process connections.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected in both directions.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Frames values of `T` on any byte stream.
///
/// A split connection uses one codec per half, typed for the direction.
pub struct JsonCodec<T> {
    framing: LengthDelimitedCodec,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        let framing = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            framing,
            _frame: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        self.framing
            .decode(src)?
            .map(|frame| serde_json::from_slice(&frame).map_err(invalid_data))
            .transpose()
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&item).map_err(invalid_data)?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.framing.encode(Bytes::from(json), dst)
    }
}
