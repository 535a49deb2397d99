//! Synthetic object payloads backed by a shared random buffer.
//!
//! A [`RandomBuffer`] is filled with random bytes once at startup. Every [`SyntheticPayload`]
//! opened from it represents a logical byte stream of arbitrary length that tiles the buffer:
//! the byte at offset `n` is `buffer[n % buffer.len()]`. Opening a payload never allocates memory
//! proportional to its size, regardless of how large the object is.
//!
//! Payloads can be consumed in three ways:
//!
//! - As a blocking [`std::io::Read`] + [`std::io::Seek`] source.
//! - As a [`tokio::io::AsyncRead`] + [`tokio::io::AsyncSeek`] source.
//! - As a stream of [`Bytes`] chunks via [`SyntheticPayload::into_stream`], where every chunk is
//!   a reference-counted slice of the shared buffer.

use std::io::{self, SeekFrom};
use std::ops::Range;
use std::pin::Pin;
use std::{fmt, task};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::error::{Error, Result};

/// Default size of the shared random buffer (8 MiB).
pub const DEFAULT_BUFFER_SIZE: u64 = 1 << 23;

/// Largest supported size of the shared random buffer (256 MiB).
pub const MAX_BUFFER_SIZE: u64 = 1 << 28;

/// Upper bound for a single chunk yielded by [`SyntheticPayload::into_stream`].
const STREAM_CHUNK_SIZE: usize = 256 * 1024;

/// A stream of payload chunks, suitable as a streaming request body.
pub type PayloadStream = BoxStream<'static, io::Result<Bytes>>;

/// Immutable random bytes shared by all payloads of a process.
///
/// Cloning is cheap and shares the underlying allocation.
#[derive(Clone)]
pub struct RandomBuffer {
    bytes: Bytes,
    /// Checksum state over the entire buffer, combined repeatedly for long payloads.
    full_digest: crc32fast::Hasher,
}

impl RandomBuffer {
    /// Creates a buffer of `len` bytes filled from a freshly seeded fast RNG.
    pub fn new(len: usize) -> Result<Self> {
        Self::from_rng(len, &mut SmallRng::from_rng(&mut rand::rng()))
    }

    /// Creates a buffer with deterministic contents derived from `seed`.
    pub fn with_seed(len: usize, seed: u64) -> Result<Self> {
        Self::from_rng(len, &mut SmallRng::seed_from_u64(seed))
    }

    fn from_rng(len: usize, rng: &mut impl RngCore) -> Result<Self> {
        if len == 0 {
            return Err(Error::EmptyPayloadBuffer);
        }

        let mut buf = vec![0; len];
        rng.fill_bytes(&mut buf);

        let mut full_digest = crc32fast::Hasher::new();
        full_digest.update(&buf);

        Ok(Self {
            bytes: buf.into(),
            full_digest,
        })
    }

    /// The number of random bytes backing all payloads.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`, construction rejects empty buffers.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Opens a new payload of `size` bytes positioned at offset 0.
    pub fn open(&self, size: u64) -> SyntheticPayload {
        SyntheticPayload {
            buffer: self.clone(),
            size,
            pos: 0,
        }
    }

    /// Returns the CRC32 checksum of the first `size` bytes of the logical stream.
    ///
    /// All payloads of the same size have the same content, so this is also the checksum of any
    /// payload opened with that size.
    pub fn checksum(&self, size: u64) -> u32 {
        let len = self.bytes.len() as u64;
        let mut hasher = crc32fast::Hasher::new();
        for _ in 0..size / len {
            hasher.combine(&self.full_digest);
        }
        hasher.update(&self.bytes[..(size % len) as usize]);
        hasher.finalize()
    }
}

impl fmt::Debug for RandomBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomBuffer")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// A readable and seekable view of `size` bytes tiled from a [`RandomBuffer`].
///
/// The cursor only ever moves through [`Read`](io::Read), [`Seek`](io::Seek) or their async
/// counterparts. Seeking beyond the end is allowed; subsequent reads then report end of stream.
#[derive(Clone, Debug)]
pub struct SyntheticPayload {
    buffer: RandomBuffer,
    size: u64,
    pos: u64,
}

impl SyntheticPayload {
    /// The total logical length of this payload in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The current cursor position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// The number of bytes left before end of stream.
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.pos)
    }

    /// CRC32 checksum of the full payload content, independent of the cursor.
    pub fn checksum(&self) -> u32 {
        self.buffer.checksum(self.size)
    }

    /// Converts the remainder of this payload into a stream of zero-copy chunks.
    pub fn into_stream(self) -> PayloadStream {
        stream::unfold(self, |mut payload| async move {
            payload.advance(STREAM_CHUNK_SIZE).map(|range| {
                let chunk = payload.buffer.bytes.slice(range);
                (Ok::<_, io::Error>(chunk), payload)
            })
        })
        .boxed()
    }

    /// Moves the cursor forward by up to `max` bytes without crossing the buffer boundary.
    ///
    /// Returns the range of the shared buffer covering the consumed bytes, or `None` at end of
    /// stream.
    fn advance(&mut self, max: usize) -> Option<Range<usize>> {
        if self.pos >= self.size || max == 0 {
            return None;
        }

        let buffer_len = self.buffer.bytes.len() as u64;
        let start = (self.pos % buffer_len) as usize;
        let len = (self.size - self.pos)
            .min(buffer_len - start as u64)
            .min(max as u64) as usize;

        self.pos += len as u64;
        Some(start..start + len)
    }

    fn seek_to(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
            SeekFrom::End(offset) => self.size.checked_add_signed(offset),
        };

        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid offset: seek to a negative or overflowing position",
            ));
        };

        self.pos = target;
        Ok(target)
    }
}

impl io::Read for SyntheticPayload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while let Some(range) = self.advance(buf.len() - filled) {
            let len = range.len();
            buf[filled..filled + len].copy_from_slice(&self.buffer.bytes[range]);
            filled += len;
        }
        Ok(filled)
    }
}

impl io::Seek for SyntheticPayload {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_to(pos)
    }
}

impl AsyncRead for SyntheticPayload {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        while let Some(range) = this.advance(buf.remaining()) {
            buf.put_slice(&this.buffer.bytes[range]);
        }
        task::Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for SyntheticPayload {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        self.get_mut().seek_to(position).map(drop)
    }

    fn poll_complete(
        self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<u64>> {
        task::Poll::Ready(Ok(self.pos))
    }
}
