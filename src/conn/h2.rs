//! HTTP/2 tunnel connection.
//!
//! One CONNECT stream on a shared proxy connection: writes feed the request
//! body, reads drain the response body. Each half closes independently.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::PollSender;

use crate::transport::{ResponseBody, TransportLease};

/// Largest chunk handed to the request body per write
const MAX_WRITE_CHUNK: usize = 16 * 1024;

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel write half is closed")
}

/// One HTTP/2 CONNECT exchange presented as a byte stream.
///
/// Reads come from the response body and writes feed the request body. Each
/// half closes independently. The stream holds a lease on its transport, so a
/// transport evicted from the reuse cache stays open until this stream ends.
pub struct H2Conn {
    lease: Option<TransportLease>,
    body_tx: Option<PollSender<Bytes>>,
    response: Option<ResponseBody>,
}

impl H2Conn {
    pub fn new(lease: TransportLease, body_tx: PollSender<Bytes>, response: ResponseBody) -> Self {
        Self {
            lease: Some(lease),
            body_tx: Some(body_tx),
            response: Some(response),
        }
    }

    /// The transport this stream runs on, until closed
    pub fn lease(&self) -> Option<&TransportLease> {
        self.lease.as_ref()
    }

    pub fn is_write_closed(&self) -> bool {
        self.body_tx.is_none()
    }

    pub fn is_read_closed(&self) -> bool {
        self.response.is_none()
    }

    /// Finish the request body. A second call does nothing.
    pub fn close_write(&mut self) -> io::Result<()> {
        if let Some(mut tx) = self.body_tx.take() {
            tx.close();
        }
        Ok(())
    }

    /// Stop reading the response body. A second call does nothing.
    pub fn close_read(&mut self) -> io::Result<()> {
        self.response.take();
        Ok(())
    }

    /// Close both halves and release the transport lease.
    pub fn close(&mut self) -> io::Result<()> {
        let write = self.close_write();
        let read = self.close_read();
        self.lease.take();
        write.and(read)
    }

    /// Close the transport itself.
    ///
    /// Fails without touching anything when the transport is shared with the
    /// reuse cache or other streams.
    pub fn close_underlying(&mut self) -> io::Result<()> {
        match &self.lease {
            Some(lease) if lease.is_sole_owner() => {
                lease.force_close();
                self.close()
            }
            Some(_) => Err(io::Error::other(
                "transport is shared with other streams",
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel stream already closed",
            )),
        }
    }
}

impl AsyncRead for H2Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.response.as_mut() {
            Some(body) => Pin::new(body).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for H2Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(tx) = self.body_tx.as_mut() else {
            return Poll::Ready(Err(broken_pipe()));
        };
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        let n = buf.len().min(MAX_WRITE_CHUNK);
        tx.send_item(Bytes::copy_from_slice(&buf[..n]))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close_write())
    }
}
