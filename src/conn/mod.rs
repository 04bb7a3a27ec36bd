//! Stream connections returned by the dialers.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

mod h2;
mod plain;

pub use self::h2::H2Conn;
pub use plain::PlainConn;

/// Bidirectional async byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream to a proxy
pub type BoxedStream = Box<dyn AsyncStream>;

/// Tunnel to the target, usable like a raw TCP connection.
pub enum TunnelConn {
    /// HTTP/1.1 CONNECT over a dedicated transport
    Plain(PlainConn),
    /// One stream of a multiplexed HTTP/2 transport
    H2(H2Conn),
    /// SOCKS5 tunnel
    Socks(TcpStream),
}

impl TunnelConn {
    pub fn is_h2(&self) -> bool {
        matches!(self, TunnelConn::H2(_))
    }

    /// Close the write half. For HTTP/2 this ends the request body.
    pub async fn close_write(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        match self {
            TunnelConn::Plain(c) => c.shutdown().await,
            TunnelConn::H2(c) => c.close_write(),
            TunnelConn::Socks(s) => s.shutdown().await,
        }
    }
}

impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelConn::Plain(_) => f.write_str("TunnelConn::Plain"),
            TunnelConn::H2(_) => f.write_str("TunnelConn::H2"),
            TunnelConn::Socks(s) => write!(f, "TunnelConn::Socks({:?})", s.peer_addr().ok()),
        }
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(c) => Pin::new(c).poll_read(cx, buf),
            TunnelConn::H2(c) => Pin::new(c).poll_read(cx, buf),
            TunnelConn::Socks(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelConn::Plain(c) => Pin::new(c).poll_write(cx, buf),
            TunnelConn::H2(c) => Pin::new(c).poll_write(cx, buf),
            TunnelConn::Socks(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(c) => Pin::new(c).poll_flush(cx),
            TunnelConn::H2(c) => Pin::new(c).poll_flush(cx),
            TunnelConn::Socks(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(c) => Pin::new(c).poll_shutdown(cx),
            TunnelConn::H2(c) => Pin::new(c).poll_shutdown(cx),
            TunnelConn::Socks(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
