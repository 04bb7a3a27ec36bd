//! Multiplexed proxy transports.
//!
//! A transport carries many CONNECT exchanges over one connection to the
//! proxy. The default implementation is HTTP/2 via `h2`; callers can plug
//! their own through [`TransportConnector`].

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::conn::BoxedStream;
use crate::error::Result;

mod h2;
mod shared;

pub use self::h2::{H2Connector, H2Transport};
pub use shared::{ReuseCache, TransportLease};

/// Number of in-flight body chunks before writers are blocked.
pub const BODY_CHANNEL_CAPACITY: usize = 8;

/// CONNECT request sent over a multiplexed transport
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Target authority, `host:port`
    pub authority: String,
    /// Headers sent with the request
    pub headers: HeaderMap,
}

/// Response body of a CONNECT exchange
pub type ResponseBody = Box<dyn AsyncRead + Send + Unpin>;

/// Response to a CONNECT request
pub struct ConnectResponse {
    pub status: StatusCode,
    /// Bytes sent by the target through the tunnel
    pub body: ResponseBody,
}

impl fmt::Debug for ConnectResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Request body of a CONNECT exchange.
///
/// Yields chunks written to the tunnel; `None` once the write half is closed.
pub struct RequestBody {
    rx: mpsc::Receiver<Bytes>,
}

impl RequestBody {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody").finish_non_exhaustive()
    }
}

/// Create the bounded channel feeding a CONNECT request body.
pub fn body_channel() -> (PollSender<Bytes>, RequestBody) {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    (PollSender::new(tx), RequestBody { rx })
}

/// One connection to the proxy carrying many CONNECT streams.
#[async_trait]
pub trait MultiplexedTransport: Send + Sync {
    /// Whether another CONNECT stream can be opened right now
    fn can_accept_new_stream(&self) -> bool;

    /// Send a CONNECT request and wait for the response head.
    async fn round_trip(&self, req: ConnectRequest, body: RequestBody) -> Result<ConnectResponse>;

    /// Tear down the connection. Idempotent.
    fn close(&self);
}

/// Builds a multiplexed transport on top of an established stream to the proxy.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, io: BoxedStream) -> Result<Arc<dyn MultiplexedTransport>>;
}
