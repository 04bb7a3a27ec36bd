//! HTTP/2 CONNECT transport built on the `h2` client.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h2::client::SendRequest;
use h2::{Reason, RecvStream, SendStream};
use http::{Method, Request, Version};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::AbortHandle;
use tracing::debug;

use super::{
    ConnectRequest, ConnectResponse, MultiplexedTransport, RequestBody, TransportConnector,
};
use crate::conn::BoxedStream;
use crate::error::{ConnectErrorKind, Result, TunnelError};

fn h2_error(context: &str, e: h2::Error) -> TunnelError {
    TunnelError::connect(ConnectErrorKind::Http2, format!("{}: {}", context, e))
}

/// Default [`TransportConnector`]: performs the HTTP/2 client handshake and
/// drives the connection on a background task.
#[derive(Debug, Clone, Default)]
pub struct H2Connector {
    initial_window_size: Option<u32>,
}

impl H2Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-stream receive window advertised to the proxy
    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = Some(size);
        self
    }
}

#[async_trait]
impl TransportConnector for H2Connector {
    async fn connect(&self, io: BoxedStream) -> Result<Arc<dyn MultiplexedTransport>> {
        let mut builder = h2::client::Builder::new();
        if let Some(size) = self.initial_window_size {
            builder.initial_window_size(size);
        }
        let (send_request, connection) = builder
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| h2_error("HTTP/2 handshake failed", e))?;

        let alive = Arc::new(AtomicBool::new(true));
        let driver_alive = alive.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "proxy HTTP/2 connection ended with error");
            }
            driver_alive.store(false, Ordering::Release);
        });

        Ok(Arc::new(H2Transport {
            send_request: Mutex::new(send_request),
            alive,
            closed: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            driver: driver.abort_handle(),
        }))
    }
}

/// HTTP/2 connection to the proxy
pub struct H2Transport {
    send_request: Mutex<SendRequest<Bytes>>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    active: Arc<AtomicUsize>,
    driver: AbortHandle,
}

impl H2Transport {
    /// Streams currently open on this connection
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MultiplexedTransport for H2Transport {
    fn can_accept_new_stream(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || !self.alive.load(Ordering::Acquire) {
            return false;
        }
        let max = self.send_request.lock().current_max_send_streams();
        self.active.load(Ordering::Acquire) < max
    }

    async fn round_trip(&self, req: ConnectRequest, body: RequestBody) -> Result<ConnectResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::connect(
                ConnectErrorKind::Http2,
                "HTTP/2 transport is closed",
            ));
        }
        let slot = Arc::new(StreamSlot::acquire(self.active.clone()));

        let send_request = self.send_request.lock().clone();
        let mut send_request = send_request
            .ready()
            .await
            .map_err(|e| h2_error("HTTP/2 connection not ready", e))?;

        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(req.authority.as_str())
            .version(Version::HTTP_2);
        for (name, value) in req.headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder.body(()).map_err(|e| {
            TunnelError::connect(
                ConnectErrorKind::Http2,
                format!("invalid CONNECT request: {}", e),
            )
        })?;

        let (response, send_stream) = send_request
            .send_request(request, false)
            .map_err(|e| h2_error("failed to send CONNECT request", e))?;

        tokio::spawn(pump_body(send_stream, body, slot.clone()));

        let response = response
            .await
            .map_err(|e| h2_error("CONNECT request failed", e))?;
        let (parts, recv) = response.into_parts();
        debug!(status = %parts.status, authority = %req.authority, "HTTP/2 CONNECT response");

        Ok(ConnectResponse {
            status: parts.status,
            body: Box::new(H2Body {
                recv,
                pending: Bytes::new(),
                _slot: slot,
            }),
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.driver.abort();
        }
    }
}

/// Counts one open stream against the connection's concurrency limit.
struct StreamSlot {
    active: Arc<AtomicUsize>,
}

impl StreamSlot {
    fn acquire(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self { active }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Copy request body chunks onto the HTTP/2 stream, honoring flow control.
async fn pump_body(mut stream: SendStream<Bytes>, mut body: RequestBody, _slot: Arc<StreamSlot>) {
    loop {
        let chunk = tokio::select! {
            chunk = body.recv() => chunk,
            _ = poll_fn(|cx| stream.poll_reset(cx)) => return,
        };
        let Some(mut chunk) = chunk else {
            let _ = stream.send_data(Bytes::new(), true);
            return;
        };

        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let capacity = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    debug!(error = %e, "HTTP/2 tunnel stream closed while writing");
                    return;
                }
                None => return,
            };
            if capacity == 0 {
                continue;
            }
            let data = chunk.split_to(capacity.min(chunk.len()));
            if let Err(e) = stream.send_data(data, false) {
                debug!(error = %e, "HTTP/2 tunnel stream closed while writing");
                return;
            }
        }
    }
}

/// Response body of an HTTP/2 CONNECT stream
struct H2Body {
    recv: RecvStream,
    pending: Bytes,
    _slot: Arc<StreamSlot>,
}

impl AsyncRead for H2Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(self.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = self.recv.flow_control().release_capacity(data.len());
                    self.pending = data;
                }
                Some(Err(e)) if e.reason() == Some(Reason::NO_ERROR) => {
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => {
                    let err = match e.get_io() {
                        Some(io_err) => io::Error::new(io_err.kind(), e.to_string()),
                        None => io::Error::other(e),
                    };
                    return Poll::Ready(Err(err));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}
