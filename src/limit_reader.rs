//! Bounded body reader
//!
//! Upstream `Content-Length` headers can be absent or lying, so every body
//! is drained through a byte budget. A chunk that would cross the ceiling
//! fails the read with a typed error instead of growing the buffer.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::error::{ProxyError, Result};

/// Byte stream wrapper that refuses to deliver more than `limit` bytes.
pub struct LimitedReader<S> {
    stream: std::pin::Pin<Box<S>>,
    remaining: u64,
    limit: u64,
}

impl<S, E> LimitedReader<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    pub fn new(stream: S, limit: u64) -> Self {
        LimitedReader {
            stream: Box::pin(stream),
            remaining: limit,
            limit,
        }
    }

    /// Next chunk of the wrapped stream, or `BodyTooLarge` once the budget
    /// is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        let chunk = match self.stream.next().await? {
            Ok(chunk) => chunk,
            Err(e) => {
                return Some(Err(ProxyError::Upstream(format!(
                    "error reading response body: {e}"
                ))))
            }
        };

        if chunk.len() as u64 > self.remaining {
            self.remaining = 0;
            return Some(Err(ProxyError::BodyTooLarge { limit: self.limit }));
        }
        self.remaining -= chunk.len() as u64;
        Some(Ok(chunk))
    }

    /// Drain the stream into a single buffer, respecting the budget.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
        let owned: Vec<std::result::Result<Bytes, Infallible>> =
            parts.iter().map(|p| Ok(Bytes::copy_from_slice(p))).collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn test_collect_within_budget() {
        let reader = LimitedReader::new(chunks(&[b"hello ", b"world"]), 64);
        assert_eq!(reader.collect().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_collect_exact_budget() {
        let reader = LimitedReader::new(chunks(&[b"hello"]), 5);
        assert_eq!(reader.collect().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_collect_over_budget_fails() {
        let reader = LimitedReader::new(chunks(&[b"hello ", b"world"]), 8);
        match reader.collect().await {
            Err(ProxyError::BodyTooLarge { limit }) => assert_eq!(limit, 8),
            other => panic!("expected BodyTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_budget_exhausts_across_chunks() {
        let mut reader = LimitedReader::new(chunks(&[b"aaaa", b"bbbb", b"cccc"]), 8);
        assert!(reader.next_chunk().await.unwrap().is_ok());
        assert!(reader.next_chunk().await.unwrap().is_ok());
        assert!(matches!(
            reader.next_chunk().await.unwrap(),
            Err(ProxyError::BodyTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let reader = LimitedReader::new(chunks(&[]), 4);
        assert_eq!(reader.collect().await.unwrap(), Bytes::new());
    }
}
