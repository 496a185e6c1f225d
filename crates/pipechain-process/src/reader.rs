//! Byte-stream view over an output channel

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Receiving side of a command's stdout or stderr channel
pub type OutputReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Adapts an [`OutputReceiver`] into an [`AsyncRead`].
///
/// Chunk boundaries are not preserved. Bytes that do not fit in the caller's
/// buffer are kept for the next read. Once the channel is closed and the
/// leftover is drained, every read reports end-of-stream.
#[derive(Debug)]
pub struct ChunkReader {
    input: OutputReceiver,
    leftover: Vec<u8>,
    offset: usize,
    closed: bool,
}

impl ChunkReader {
    pub fn new(input: OutputReceiver) -> Self {
        Self {
            input,
            leftover: Vec::new(),
            offset: 0,
            closed: false,
        }
    }

    fn pending_bytes(&self) -> &[u8] {
        &self.leftover[self.offset..]
    }
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending_bytes().is_empty() && !this.closed {
            match this.input.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.leftover = chunk;
                    this.offset = 0;
                }
                Poll::Ready(None) => this.closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.pending_bytes().len().min(buf.remaining());
        buf.put_slice(&this.leftover[this.offset..this.offset + n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

/// Collect every chunk until the channel closes
pub async fn drain(mut input: OutputReceiver) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = input.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_leftover_is_kept_for_next_read() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(b"hello world".to_vec()).unwrap();
        drop(tx);

        let mut reader = ChunkReader::new(rx);
        let mut buf = [0u8; 5];

        assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b" worl");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"d");
    }

    #[tokio::test]
    async fn test_eof_is_idempotent() {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        drop(tx);

        let mut reader = ChunkReader::new(rx);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_chunks_are_skipped() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Vec::new()).unwrap();
        tx.send(b"ok".to_vec()).unwrap();
        drop(tx);

        let mut out = String::new();
        ChunkReader::new(rx).read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn test_drain_concatenates_chunks() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for part in ["HE", "LL", "O\n"] {
                tx.send(part.as_bytes().to_vec()).unwrap();
            }
        });

        assert_eq!(drain(rx).await, b"HELLO\n");
    }
}
