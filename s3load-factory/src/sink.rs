//! A write-only sink for downloaded object content.

use std::pin::Pin;
use std::{fmt, io, task};

use tokio::io::AsyncWrite;

/// Discards written bytes while counting them and, optionally, computing their checksum.
///
/// Use this as the download target of a read so that object content is never buffered.
#[derive(Clone, Default)]
pub struct DigestSink {
    len: u64,
    digest: Option<crc32fast::Hasher>,
}

impl DigestSink {
    /// Creates a sink that only counts bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that also computes the CRC32 of everything written.
    pub fn with_digest() -> Self {
        Self {
            len: 0,
            digest: Some(crc32fast::Hasher::new()),
        }
    }

    /// Total number of bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The checksum of all bytes written so far, if digesting.
    pub fn checksum(&self) -> Option<u32> {
        self.digest.clone().map(crc32fast::Hasher::finalize)
    }

    fn consume(&mut self, buf: &[u8]) -> usize {
        if let Some(digest) = &mut self.digest {
            digest.update(buf);
        }
        self.len += buf.len() as u64;
        buf.len()
    }
}

impl fmt::Debug for DigestSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestSink")
            .field("len", &self.len)
            .field("digest", &self.digest.is_some())
            .finish()
    }
}

impl io::Write for DigestSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.consume(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncWrite for DigestSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        task::Poll::Ready(Ok(self.get_mut().consume(buf)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut task::Context<'_>) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::payload::RandomBuffer;

    #[test]
    fn counts_without_digest() {
        let mut sink = DigestSink::new();
        sink.write_all(b"oh hai!").unwrap();

        assert_eq!(sink.len(), 7);
        assert_eq!(sink.checksum(), None);
    }

    #[test]
    fn digest_matches_payload_checksum() {
        let buffer = RandomBuffer::with_seed(128, 1).unwrap();
        let payload = buffer.open(1000);

        let mut sink = DigestSink::with_digest();
        io::copy(&mut payload.clone(), &mut sink).unwrap();

        assert_eq!(sink.len(), 1000);
        assert_eq!(sink.checksum(), Some(payload.checksum()));
    }

    #[tokio::test]
    async fn async_copy_from_payload() {
        use tokio::io::AsyncWriteExt;

        let buffer = RandomBuffer::with_seed(128, 1).unwrap();
        let mut payload = buffer.open(777);

        let mut sink = DigestSink::with_digest();
        tokio::io::copy(&mut payload, &mut sink).await.unwrap();
        sink.shutdown().await.unwrap();

        assert_eq!(sink.len(), 777);
        assert_eq!(sink.checksum(), Some(buffer.checksum(777)));
    }
}
