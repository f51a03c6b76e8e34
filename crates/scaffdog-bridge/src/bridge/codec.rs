//! Framed codec for byte-stream channels.
//!
//! Frames are a 4-byte big-endian length followed by a JSON document.
//! Used by [`Port::framed`](super::channel::Port::framed) over pipes, stdio
//! or sockets.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected before they are buffered.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
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
            inner: framing(max),
            _phantom: PhantomData,
        }
    }
}

/// The length prefix framing alone, without the JSON layer.
pub fn framing(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        // The frame is consumed either way, so a bad document only costs itself.
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
