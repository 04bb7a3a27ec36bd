//! HTTP/1.1 tunnel connection.
//!
//! The raw proxy stream after a successful CONNECT, replaying any bytes read
//! past the response head before reading from the stream again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::BoxedStream;

/// Raw transport to the proxy after a successful HTTP/1.1 CONNECT.
///
/// Bytes the proxy sent past the response head are replayed before reading
/// from the transport.
pub struct PlainConn {
    inner: BoxedStream,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl PlainConn {
    pub fn new(inner: BoxedStream, buffer: Vec<u8>) -> Self {
        Self {
            inner,
            buffer,
            buffer_pos: 0,
        }
    }

    /// Bytes still waiting to be replayed
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.buffer_pos..]
    }

    pub fn get_ref(&self) -> &BoxedStream {
        &self.inner
    }

    /// Unwrap the transport. Unread buffered bytes are dropped.
    pub fn into_inner(self) -> BoxedStream {
        self.inner
    }
}

impl AsyncRead for PlainConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buffer_pos < self.buffer.len() {
            let remaining = &self.buffer[self.buffer_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.buffer_pos += to_copy;
            if self.buffer_pos == self.buffer.len() {
                self.buffer = Vec::new();
                self.buffer_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PlainConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
