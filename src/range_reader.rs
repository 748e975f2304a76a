//! Random access over remote file bytes
//!
//! [`RemoteRangeReader`] turns read/seek calls into HTTP range requests
//! against the aggregator. The most recently opened range stays open, so a
//! run of small sequential reads drains one response body instead of paying
//! a round trip each. Any read that does not continue exactly where the
//! open range left off drops it and fetches afresh.

use crate::aggregator::Aggregator;
use crate::blob::{resolve_seek, BlobReader, ByteStream};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::StreamExt;
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::trace;

/// A partially consumed range response
pub(crate) struct OpenRange {
    /// Absolute blob offset of the next byte this range yields
    offset: u64,
    /// Bytes still promised by the range
    remaining: u64,
    body: ByteStream,
    pending: Bytes,
}

impl OpenRange {
    pub(crate) fn new(offset: u64, len: u64, body: ByteStream) -> Self {
        Self {
            offset,
            remaining: len,
            body,
            pending: Bytes::new(),
        }
    }

    /// Fill `buf` (bounded by what the range still promises).
    ///
    /// A body that ends early is a `ShortRead`, never a silent truncation.
    pub(crate) async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let mut filled = 0;

        while filled < want {
            if self.pending.is_empty() {
                match self.body.next().await {
                    Some(Ok(chunk)) => {
                        self.pending = chunk;
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(StorageError::ShortRead {
                            expected: self.remaining,
                            actual: 0,
                        })
                    }
                }
            }

            let n = self.pending.len().min(want - filled);
            buf[filled..filled + n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            filled += n;
            self.offset += n as u64;
            self.remaining -= n as u64;
        }

        Ok(filled)
    }
}

/// Seekable reader over a file held only by the aggregator
pub struct RemoteRangeReader {
    aggregator: Arc<dyn Aggregator>,
    file_id: u64,
    size: u64,
    offset: u64,
    /// Minimum bytes requested per fetch
    read_ahead: u64,
    open: Option<OpenRange>,
}

impl RemoteRangeReader {
    pub fn new(aggregator: Arc<dyn Aggregator>, file_id: u64, size: u64) -> Self {
        Self {
            aggregator,
            file_id,
            size,
            offset: 0,
            read_ahead: 0,
            open: None,
        }
    }

    /// Request at least `bytes` per fetch so later reads can reuse the stream
    pub fn with_read_ahead(mut self, bytes: u64) -> Self {
        self.read_ahead = bytes;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    async fn open_range(&mut self, len: u64) -> Result<OpenRange> {
        let last = self.offset + len - 1;
        let header = format!("bytes={}-{}", self.offset, last);
        trace!(file_id = self.file_id, range = %header, "Opening remote range");

        let response = self.aggregator.retrieve(self.file_id, Some(&header)).await?;
        match response.status {
            206 => {}
            // A server that ignores Range is only usable from the start
            200 if self.offset == 0 => {}
            status => {
                return Err(StorageError::Remote {
                    status,
                    message: format!("range {header} was not honoured"),
                })
            }
        }
        Ok(OpenRange::new(self.offset, len, response.body))
    }
}

#[async_trait]
impl BlobReader for RemoteRangeReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf
            .len()
            .min(usize::try_from(self.size - self.offset).unwrap_or(usize::MAX));
        let mut filled = 0;

        // Drain the open range when it continues exactly from here.
        if let Some(open) = self.open.as_mut() {
            if open.offset == self.offset && open.remaining > 0 {
                match open.read_into(&mut buf[..want]).await {
                    Ok(n) => {
                        filled += n;
                        self.offset += n as u64;
                    }
                    Err(e) => {
                        self.open = None;
                        return Err(e);
                    }
                }
            }
        }
        if self
            .open
            .as_ref()
            .is_some_and(|open| open.offset != self.offset || open.remaining == 0)
        {
            self.open = None;
        }

        // Each fetch covers the rest of the request, so this runs at most
        // once per call unless the range returns an error.
        while filled < want {
            let needed = (want - filled) as u64;
            let len = needed.max(self.read_ahead).min(self.size - self.offset);
            let mut open = self.open_range(len).await?;
            let n = open.read_into(&mut buf[filled..want]).await?;
            filled += n;
            self.offset += n as u64;
            if open.remaining > 0 {
                self.open = Some(open);
            }
        }

        Ok(filled)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.offset = resolve_seek(pos, self.offset, self.size)?;
        Ok(self.offset)
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn close(&mut self) -> Result<()> {
        self.open = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MemoryAggregator;
    use crate::blob::read_to_end;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn reader(agg: &Arc<MemoryAggregator>, data: &[u8]) -> RemoteRangeReader {
        let id = agg.insert_file(1, "blob", data.to_vec());
        RemoteRangeReader::new(agg.clone(), id, data.len() as u64)
    }

    #[tokio::test]
    async fn test_small_sequential_reads_match_full_read() {
        let agg = Arc::new(MemoryAggregator::new().with_retrieve_chunk_size(7));
        let data = content(1000);

        let mut whole = reader(&agg, &data);
        assert_eq!(read_to_end(&mut whole).await.unwrap(), data);

        let mut pieces = reader(&agg, &data);
        let mut out = Vec::new();
        let mut buf = [0u8; 23];
        loop {
            let n = pieces.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_read_ahead_reuses_stream() {
        let agg = Arc::new(MemoryAggregator::new().with_retrieve_chunk_size(16));
        let data = content(300);
        let mut reader = reader(&agg, &data).with_read_ahead(1024);

        let mut buf = [0u8; 10];
        let mut out = Vec::new();
        for _ in 0..30 {
            let n = reader.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(agg.retrieve_calls(), 1);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_without_read_ahead_fetches_per_read() {
        let agg = Arc::new(MemoryAggregator::new());
        let data = content(40);
        let mut reader = reader(&agg, &data);

        let mut buf = [0u8; 10];
        for _ in 0..4 {
            assert_eq!(reader.read(&mut buf).await.unwrap(), 10);
        }
        assert_eq!(agg.retrieve_calls(), 4);
    }

    #[tokio::test]
    async fn test_seek_then_read() {
        let agg = Arc::new(MemoryAggregator::new().with_retrieve_chunk_size(5));
        let data = content(500);
        let mut reader = reader(&agg, &data).with_read_ahead(64);

        let mut buf = [0u8; 32];
        reader.read(&mut buf).await.unwrap();

        for offset in [0u64, 1, 99, 250, 468, 499] {
            assert_eq!(reader.seek(SeekFrom::Start(offset)).await.unwrap(), offset);
            let n = reader.read(&mut buf).await.unwrap();
            let expected = &data[offset as usize..(offset as usize + 32).min(500)];
            assert_eq!(&buf[..n], expected);
        }

        assert_eq!(reader.seek(SeekFrom::End(0)).await.unwrap(), 500);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seek_out_of_bounds() {
        let agg = Arc::new(MemoryAggregator::new());
        let mut reader = reader(&agg, &content(10));

        assert!(matches!(
            reader.seek(SeekFrom::Current(-1)).await,
            Err(StorageError::InvalidSeek(_))
        ));
        assert!(reader.seek(SeekFrom::Start(11)).await.is_err());
        // Failed seeks leave the offset alone
        assert_eq!(reader.offset(), 0);
        // No I/O on seek
        reader.seek(SeekFrom::Start(5)).await.unwrap();
        assert_eq!(agg.retrieve_calls(), 0);
    }

    #[tokio::test]
    async fn test_truncated_body_is_short_read() {
        let body: ByteStream = Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]));
        let mut open = OpenRange::new(0, 10, body);

        let mut buf = [0u8; 10];
        let err = open.read_into(&mut buf).await.unwrap_err();
        assert!(matches!(err, StorageError::ShortRead { expected: 7, actual: 0 }));
    }

    #[tokio::test]
    async fn test_close_drops_open_range() {
        let agg = Arc::new(MemoryAggregator::new());
        let data = content(100);
        let mut reader = reader(&agg, &data).with_read_ahead(100);

        let mut buf = [0u8; 10];
        reader.read(&mut buf).await.unwrap();
        reader.close().await.unwrap();
        reader.read(&mut buf).await.unwrap();
        assert_eq!(agg.retrieve_calls(), 2);
        assert_eq!(&buf, &data[10..20]);
    }

    #[tokio::test]
    async fn test_reader_moves_across_tasks() {
        let agg = Arc::new(MemoryAggregator::new().with_retrieve_chunk_size(9));
        let data = content(200);
        let mut reader: Box<dyn BlobReader> = Box::new(reader(&agg, &data).with_read_ahead(50));

        let (reader, head) = tokio::spawn(async move {
            let mut buf = [0u8; 20];
            let n = reader.read(&mut buf).await.unwrap();
            (reader, buf[..n].to_vec())
        })
        .await
        .unwrap();
        assert_eq!(head, &data[..20]);

        let mut reader = reader;
        let rest = tokio::spawn(async move { read_to_end(reader.as_mut()).await.unwrap() })
            .await
            .unwrap();
        assert_eq!(rest, &data[20..]);
    }
}
