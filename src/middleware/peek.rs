use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::buffer_pool::GLOBAL_BUFFER_POOL;

/// Reader adapter that exposes a prefix of the stream without consuming it.
/// Subsequent reads replay the peeked bytes before continuing from the
/// source, so the downstream consumer observes the stream unmodified.
pub struct PeekReader<R> {
    source: R,
    peek_buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            peek_buf: GLOBAL_BUFFER_POOL.get_small(),
            pos: 0,
        }
    }

    /// Buffer up to `n` bytes from the source and return them. Returns
    /// fewer bytes when the stream ends first. Must be called before any
    /// read has consumed peeked data.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.peek_buf.len() < n {
            let read = self.source.read_buf(&mut self.peek_buf).await?;
            if read == 0 {
                break;
            }
        }
        Ok(&self.peek_buf[..self.peek_buf.len().min(n)])
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pos < this.peek_buf.len() {
            let n = buf.remaining().min(this.peek_buf.len() - this.pos);
            buf.put_slice(&this.peek_buf[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.source).poll_read(cx, buf)
    }
}

impl<R> Drop for PeekReader<R> {
    fn drop(&mut self) {
        GLOBAL_BUFFER_POOL.put(std::mem::take(&mut self.peek_buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields its input in fixed-size fragments, to exercise
    /// peeks spanning multiple source reads.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for Chunked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = &mut *self;
            if this.pos < this.data.len() {
                let n = this.chunk.min(this.data.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.data[this.pos..this.pos + n]);
                this.pos += n;
            }
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let data = b"hello peek reader".to_vec();
        let mut reader = PeekReader::new(Cursor::new(data.clone()));

        let peeked = reader.peek(5).await.unwrap();
        assert_eq!(peeked, b"hello");

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn peek_transparency_for_all_sizes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for k in [0, 1, 7, 100, 999, 1000] {
            let mut reader = PeekReader::new(Chunked {
                data: data.clone(),
                pos: 0,
                chunk: 13,
            });
            let peeked = reader.peek(k).await.unwrap().to_vec();
            assert_eq!(peeked, data[..k]);

            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, data, "peek of {k} bytes altered the stream");
        }
    }

    #[tokio::test]
    async fn peek_beyond_eof_returns_what_exists() {
        let mut reader = PeekReader::new(Cursor::new(b"abc".to_vec()));
        let peeked = reader.peek(100).await.unwrap();
        assert_eq!(peeked, b"abc");

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn empty_stream() {
        let mut reader = PeekReader::new(Cursor::new(Vec::new()));
        assert!(reader.peek(100).await.unwrap().is_empty());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
