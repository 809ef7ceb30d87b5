use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Splits a stream into fixed-size chunks with positional offsets.
///
/// Chunks are produced lazily; the final chunk may be shorter than the
/// configured size, and an empty stream produces no chunks at all. There
/// are no content-defined boundaries: a one-byte shift in the middle of a
/// file shifts every following chunk.
pub struct FixedChunker<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> FixedChunker<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            reader,
            chunk_size,
            offset: 0,
            done: false,
        }
    }

    /// Reads the next `(offset, bytes)` chunk, or `None` once the stream
    /// is exhausted.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<(u64, Bytes)>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(self.chunk_size);
        while buf.len() < self.chunk_size {
            // Cap each read so an over-allocated buffer can never produce
            // an oversized chunk.
            let remaining = (self.chunk_size - buf.len()) as u64;
            let n = (&mut self.reader).take(remaining).read_buf(&mut buf).await?;
            if n == 0 {
                self.done = true;
                break;
            }
        }

        if buf.is_empty() {
            return Ok(None);
        }

        let offset = self.offset;
        self.offset += buf.len() as u64;
        Ok(Some((offset, buf.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::FixedChunker;
    use std::io::Cursor;

    async fn chunk_all(data: &[u8], chunk_size: usize) -> Vec<(u64, Vec<u8>)> {
        let mut chunker = FixedChunker::new(Cursor::new(data.to_vec()), chunk_size);
        let mut chunks = Vec::new();
        while let Some((offset, bytes)) = chunker.next_chunk().await.expect("read") {
            chunks.push((offset, bytes.to_vec()));
        }
        chunks
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        assert!(chunk_all(b"", 4).await.is_empty());
    }

    #[tokio::test]
    async fn exact_multiple() {
        let chunks = chunk_all(b"abcdefgh", 4).await;
        assert_eq!(
            chunks,
            vec![(0, b"abcd".to_vec()), (4, b"efgh".to_vec())],
        );
    }

    #[tokio::test]
    async fn short_final_chunk() {
        let chunks = chunk_all(b"abcdefghij", 4).await;
        assert_eq!(
            chunks,
            vec![
                (0, b"abcd".to_vec()),
                (4, b"efgh".to_vec()),
                (8, b"ij".to_vec()),
            ],
        );
    }

    #[tokio::test]
    async fn single_short_chunk() {
        let chunks = chunk_all(b"ab", 1024).await;
        assert_eq!(chunks, vec![(0, b"ab".to_vec())]);
    }

    #[tokio::test]
    async fn offsets_are_cumulative() {
        let data = vec![0u8; 5 * 1024];
        let chunks = chunk_all(&data, 1024).await;
        let offsets: Vec<u64> = chunks.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 1024, 2048, 3072, 4096]);
    }
}
