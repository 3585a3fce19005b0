//! Length-prefixed JSON frames for byte-stream transports.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected rather than buffered.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _item: PhantomData,
        }
    }
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(invalid_data)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&item).map_err(invalid_data)?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.frames.encode(Bytes::from(json), dst)
    }
}
