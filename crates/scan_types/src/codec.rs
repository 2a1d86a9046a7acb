//! Length-prefixed frame codec for the worker channel.
//!
//! # Wire Format
//!
//! | Part   | Type      | Size (bytes) | Description                              |
//! |--------|-----------|--------------|------------------------------------------|
//! | Length | `u32` BE  | 4            | Size of the body that follows.           |
//! | Body   | bincode   | `length`     | One serialized message.                  |
//!
//! A message is decoded only once its full declared length is buffered, so a
//! large page can arrive in any number of reads.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::length_delimited::LengthDelimitedCodecError;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound for a single frame body: 512 MB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame exceeds the {max} byte limit")]
    Oversized { max: usize },
    #[error("malformed frame body: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Typed codec decoding `In` and encoding `Out`.
///
/// The broker uses `FrameCodec<WorkerReply, WorkerRequest>`, the worker the
/// mirror image.
pub struct FrameCodec<In, Out> {
    inner: LengthDelimitedCodec,
    max_frame_len: usize,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            inner,
            max_frame_len,
            _marker: PhantomData,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, FrameError> {
        let frame = match self.inner.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) if is_length_error(&e) => {
                return Err(FrameError::Oversized {
                    max: self.max_frame_len,
                })
            }
            Err(e) => return Err(FrameError::Io(e)),
        };
        Ok(Some(bincode::deserialize(&frame)?))
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = FrameError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = bincode::serialize(&item)?;
        if body.len() > self.max_frame_len {
            return Err(FrameError::Oversized {
                max: self.max_frame_len,
            });
        }
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

fn is_length_error(err: &io::Error) -> bool {
    err.get_ref()
        .map_or(false, |inner| inner.is::<LengthDelimitedCodecError>())
}
