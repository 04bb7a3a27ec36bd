//! HTTP CONNECT tunnel dialer.
//!
//! Tunnels through `http://` and `https://` proxies. The protocol spoken to
//! the proxy follows ALPN: HTTP/1.1 gets a dedicated connection per tunnel,
//! HTTP/2 opens one CONNECT stream per tunnel and the connection can be
//! shared through the reuse cache.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::conn::{BoxedStream, H2Conn, PlainConn, TunnelConn};
use crate::context::DialContext;
use crate::error::{Result, TunnelError};
use crate::proxy::{ProxyScheme, ProxyUrl};
use crate::transport::{
    body_channel, ConnectRequest, H2Connector, ReuseCache, TransportConnector, TransportLease,
};
use crate::types::{Addr, Network};

use super::tls::{ALPN_H2, ALPN_HTTP1};
use super::{ContextDialer, DialerOptions, DirectDialer, RustlsDialer, TlsDial};

/// Upper bound on the HTTP/1.1 CONNECT response head
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

const PROTOCOL_UNKNOWN: u8 = 0;
const PROTOCOL_HTTP1: u8 = 1;
const PROTOCOL_HTTP2: u8 = 2;

/// Protocol spoken with the proxy for one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyProtocol {
    Http1,
    Http2,
}

impl ProxyProtocol {
    fn from_alpn(negotiated: &str) -> Result<Self> {
        match negotiated {
            "" | ALPN_HTTP1 => Ok(ProxyProtocol::Http1),
            ALPN_H2 => Ok(ProxyProtocol::Http2),
            other => Err(TunnelError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// HTTP CONNECT tunnel dialer.
///
/// Share one instance between tasks through `Arc`; concurrent dials are
/// safe and reuse the cached HTTP/2 connection when possible.
pub struct ConnectDialer {
    proxy: ProxyUrl,
    direct: DirectDialer,
    timeout: Duration,
    default_headers: HeaderMap,
    tls: Option<Arc<dyn TlsDial>>,
    transport: Arc<dyn TransportConnector>,
    cache: Option<ReuseCache>,
    // Serializes fresh negotiations so concurrent first dials share one
    // HTTP/2 connection. Skipped once the proxy is known to speak HTTP/1.1.
    gate: tokio::sync::Mutex<()>,
    protocol_hint: AtomicU8,
    h2_prior_knowledge: bool,
}

impl ConnectDialer {
    pub fn new(proxy: ProxyUrl, options: DialerOptions) -> Result<Self> {
        let direct = DirectDialer::new(options.direct)?;
        let tls = match proxy.scheme() {
            ProxyScheme::Http => None,
            ProxyScheme::Https => Some(match options.tls_dialer {
                Some(tls) => tls,
                None => Arc::new(RustlsDialer::new(direct.clone(), options.insecure)?)
                    as Arc<dyn TlsDial>,
            }),
            other => return Err(TunnelError::UnsupportedScheme(other.as_str().to_string())),
        };
        let default_headers = proxy.connect_headers(&options.headers)?;
        let transport = options
            .transport_connector
            .unwrap_or_else(|| Arc::new(H2Connector::new()));

        Ok(Self {
            timeout: direct.timeout(),
            proxy,
            direct,
            default_headers,
            tls,
            transport,
            cache: options.enable_h2_reuse.then(ReuseCache::new),
            gate: tokio::sync::Mutex::new(()),
            protocol_hint: AtomicU8::new(PROTOCOL_UNKNOWN),
            h2_prior_knowledge: options.http2_prior_knowledge,
        })
    }

    pub fn proxy(&self) -> &ProxyUrl {
        &self.proxy
    }

    /// Headers sent with every CONNECT request
    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn reuse_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Whether an HTTP/2 connection to the proxy is currently cached
    pub fn has_cached_transport(&self) -> bool {
        self.cache.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Drop the cached connection. Open streams keep it alive until they end.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Open a stream to the proxy: plain TCP for `http`, TLS for `https`.
    async fn establish(&self, ctx: &DialContext, network: Network) -> Result<(BoxedStream, String)> {
        let proxy_addr = self.proxy.addr();
        let establish = async {
            match &self.tls {
                Some(tls) => tls.dial_tls(network, proxy_addr).await,
                None => {
                    let tcp = self.direct.dial_context(ctx, network, proxy_addr).await?;
                    let protocol = if self.h2_prior_knowledge { ALPN_H2 } else { "" };
                    Ok((Box::new(tcp) as BoxedStream, protocol.to_string()))
                }
            }
        };
        tokio::select! {
            res = establish => res,
            _ = ctx.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    /// Try a CONNECT stream on the cached connection.
    ///
    /// Returns `Ok(None)` when there is nothing usable cached or the cached
    /// connection failed; the latter is evicted.
    async fn try_cached(
        &self,
        ctx: &DialContext,
        authority: &str,
        headers: &HeaderMap,
    ) -> Result<Option<TunnelConn>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let Some(lease) = cache.lookup() else {
            return Ok(None);
        };

        debug!(proxy = %self.proxy.addr(), addr = %authority, "reusing cached proxy connection");
        match self.connect_http2(ctx, lease.clone(), authority, headers).await {
            Ok(conn) => Ok(Some(conn)),
            Err(TunnelError::Cancelled) => Err(TunnelError::Cancelled),
            Err(e) => {
                debug!(error = %e, "cached proxy connection failed, negotiating a new one");
                if cache.evict_if(&lease) {
                    debug!(proxy = %self.proxy.addr(), "evicted cached proxy connection");
                }
                Ok(None)
            }
        }
    }

    async fn dial_fresh(
        &self,
        ctx: &DialContext,
        network: Network,
        authority: &str,
        headers: &HeaderMap,
    ) -> Result<TunnelConn> {
        let (stream, negotiated) = self.establish(ctx, network).await?;
        let protocol = match ProxyProtocol::from_alpn(&negotiated) {
            Ok(p) => p,
            Err(e) => {
                debug!(proxy = %self.proxy.addr(), alpn = %negotiated, "unsupported protocol, closing");
                drop(stream);
                return Err(e);
            }
        };
        debug!(proxy = %self.proxy.addr(), ?protocol, "negotiated proxy protocol");

        match protocol {
            ProxyProtocol::Http1 => {
                self.protocol_hint.store(PROTOCOL_HTTP1, Ordering::Release);
                self.connect_http1(stream, authority, headers).await
            }
            ProxyProtocol::Http2 => {
                self.protocol_hint.store(PROTOCOL_HTTP2, Ordering::Release);
                let transport = tokio::select! {
                    res = self.transport.connect(stream) => res?,
                    _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
                };
                let lease = TransportLease::new(transport);
                let conn = self
                    .connect_http2(ctx, lease.clone(), authority, headers)
                    .await?;
                if let Some(cache) = &self.cache {
                    cache.install(lease);
                }
                Ok(conn)
            }
        }
    }

    async fn connect_http1(
        &self,
        stream: BoxedStream,
        authority: &str,
        headers: &HeaderMap,
    ) -> Result<TunnelConn> {
        let deadline = Instant::now() + self.timeout;
        let request = build_http1_request(authority, headers);

        let mut reader = BufReader::new(stream);
        let write = async {
            let stream = reader.get_mut();
            stream.write_all(&request).await?;
            stream.flush().await
        };
        match tokio::time::timeout_at(deadline, write).await {
            Ok(res) => res?,
            Err(_) => {
                error!(proxy = %self.proxy.addr(), "deadline exceeded while trying to write proxy connection");
                return Err(deadline_exceeded("write"));
            }
        }

        let status = match tokio::time::timeout_at(deadline, read_response_head(&mut reader)).await
        {
            Ok(res) => res?,
            Err(_) => {
                error!(proxy = %self.proxy.addr(), "deadline exceeded while trying to read proxy connection");
                return Err(deadline_exceeded("read"));
            }
        };

        if status.code != StatusCode::OK {
            debug!(proxy = %self.proxy.addr(), status = %status.text(), "proxy rejected CONNECT");
            return Err(TunnelError::ProxyRejected {
                status: status.text(),
            });
        }

        let leftover = reader.buffer().to_vec();
        Ok(TunnelConn::Plain(PlainConn::new(reader.into_inner(), leftover)))
    }

    async fn connect_http2(
        &self,
        ctx: &DialContext,
        lease: TransportLease,
        authority: &str,
        headers: &HeaderMap,
    ) -> Result<TunnelConn> {
        let (body_tx, body) = body_channel();
        let request = ConnectRequest {
            authority: authority.to_string(),
            headers: headers.clone(),
        };

        let round_trip = tokio::time::timeout(
            self.timeout,
            lease.transport().round_trip(request, body),
        );
        let response = tokio::select! {
            res = round_trip => match res {
                Ok(res) => res?,
                Err(_) => {
                    error!(proxy = %self.proxy.addr(), "deadline exceeded while trying to read proxy connection");
                    return Err(deadline_exceeded("read"));
                }
            },
            _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
        };

        if response.status != StatusCode::OK {
            let status = status_text(response.status, None);
            debug!(proxy = %self.proxy.addr(), %status, "proxy rejected CONNECT");
            return Err(TunnelError::ProxyRejected { status });
        }
        Ok(TunnelConn::H2(H2Conn::new(lease, body_tx, response.body)))
    }
}

#[async_trait]
impl ContextDialer for ConnectDialer {
    type Conn = TunnelConn;

    async fn dial_context(
        &self,
        ctx: &DialContext,
        network: Network,
        addr: &Addr,
    ) -> Result<TunnelConn> {
        if ctx.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        let authority = addr.to_string();
        let headers = ctx.merge_headers(&self.default_headers);
        debug!(proxy = %self.proxy.addr(), addr = %authority, "CONNECT dial");

        if let Some(conn) = self.try_cached(ctx, &authority, &headers).await? {
            return Ok(conn);
        }

        let _gate = if self.cache.is_some()
            && self.protocol_hint.load(Ordering::Acquire) != PROTOCOL_HTTP1
        {
            let guard = tokio::select! {
                guard = self.gate.lock() => guard,
                _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
            };
            // Another dial may have cached a connection while we waited
            if let Some(conn) = self.try_cached(ctx, &authority, &headers).await? {
                return Ok(conn);
            }
            Some(guard)
        } else {
            None
        };

        self.dial_fresh(ctx, network, &authority, &headers).await
    }
}

impl std::fmt::Debug for ConnectDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectDialer")
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("reuse", &self.cache)
            .finish_non_exhaustive()
    }
}

fn deadline_exceeded(op: &str) -> TunnelError {
    TunnelError::IoError(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("deadline exceeded while trying to {} proxy connection", op),
    ))
}

fn status_text(code: StatusCode, reason: Option<&str>) -> String {
    match reason
        .filter(|r| !r.is_empty())
        .or_else(|| code.canonical_reason())
    {
        Some(reason) => format!("{} {}", code.as_u16(), reason),
        None => code.as_u16().to_string(),
    }
}

/// Title-case a header name the way HTTP/1.1 peers expect to see it.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

fn build_http1_request(authority: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\n\
         Host: {}\r\n",
        authority, authority
    )
    .into_bytes();

    for (name, value) in headers.iter() {
        if name == http::header::HOST {
            continue;
        }
        request.extend_from_slice(canonical_header_name(name.as_str()).as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    request
}

/// Parsed HTTP/1.1 status line
#[derive(Debug)]
struct ResponseStatus {
    code: StatusCode,
    reason: String,
}

impl ResponseStatus {
    fn parse(line: &str) -> Result<Self> {
        let invalid = || {
            TunnelError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid HTTP response: {}", line),
            ))
        };

        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(invalid());
        }
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Ok(Self { code, reason })
    }

    fn text(&self) -> String {
        status_text(self.code, Some(&self.reason))
    }
}

/// Read the status line and headers, leaving any tunneled bytes buffered.
async fn read_response_head(reader: &mut BufReader<BoxedStream>) -> Result<ResponseStatus> {
    let mut total = 0usize;
    let mut status = None;

    loop {
        let mut line = Vec::new();
        let limit = (MAX_RESPONSE_HEAD - total) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        total += n;

        if !line.ends_with(b"\n") {
            let message = if total >= MAX_RESPONSE_HEAD {
                "proxy response head too large"
            } else {
                "proxy closed connection before end of response head"
            };
            return Err(TunnelError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                message,
            )));
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        match status {
            None => status = Some(ResponseStatus::parse(text)?),
            Some(_) if text.is_empty() => break,
            Some(_) => {}
        }
    }

    status.ok_or_else(|| {
        TunnelError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing status line",
        ))
    })
}
