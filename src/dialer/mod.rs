//! Dialer implementations.
//!
//! - `DirectDialer`: plain TCP with bind address, bind device and TFO
//! - `SocksDialer`: SOCKS5 proxy tunnel
//! - `ConnectDialer`: HTTP CONNECT over HTTP/1.1 or HTTP/2, with reuse of
//!   one HTTP/2 connection to the proxy
//! - `ProxyDialer`: picks one of the above from a proxy URL

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::TunnelConn;
use crate::context::DialContext;
use crate::error::Result;
use crate::proxy::{ProxyScheme, ProxyUrl};
use crate::transport::TransportConnector;
use crate::types::{Addr, Network};

mod connect;
mod direct;
mod socks5;
mod tls;

pub use connect::ConnectDialer;
pub use direct::{DirectDialer, DirectOptions};
pub use socks5::SocksDialer;
pub use tls::{RustlsDialer, TlsDial, ALPN_H2, ALPN_HTTP1};

/// Default dialer timeout
pub const DEFAULT_DIALER_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial interface shared by every dialer.
#[async_trait]
pub trait ContextDialer: Send + Sync {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Dial without per-call options.
    async fn dial(&self, network: Network, addr: &Addr) -> Result<Self::Conn> {
        self.dial_context(&DialContext::default(), network, addr)
            .await
    }

    /// Dial with per-call headers and cancellation.
    async fn dial_context(
        &self,
        ctx: &DialContext,
        network: Network,
        addr: &Addr,
    ) -> Result<Self::Conn>;
}

/// Options for building a proxy dialer.
#[derive(Clone)]
pub struct DialerOptions {
    /// Options for the TCP connection to the proxy
    pub direct: DirectOptions,
    /// Headers sent with every CONNECT request
    pub headers: HeaderMap,
    /// Reuse one HTTP/2 connection to the proxy across dials
    pub enable_h2_reuse: bool,
    /// Speak HTTP/2 to plain `http://` proxies without negotiation
    pub http2_prior_knowledge: bool,
    /// Skip certificate verification with the default TLS dialer
    pub insecure: bool,
    /// TLS dialer for `https://` proxies; defaults to [`RustlsDialer`]
    pub tls_dialer: Option<Arc<dyn TlsDial>>,
    /// HTTP/2 transport builder; defaults to [`H2Connector`]
    ///
    /// [`H2Connector`]: crate::transport::H2Connector
    pub transport_connector: Option<Arc<dyn TransportConnector>>,
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self {
            direct: DirectOptions::default(),
            headers: HeaderMap::new(),
            enable_h2_reuse: true,
            http2_prior_knowledge: false,
            insecure: false,
            tls_dialer: None,
            transport_connector: None,
        }
    }
}

impl DialerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.direct.timeout = timeout;
        self
    }

    pub fn with_local_addr(mut self, ip: IpAddr) -> Self {
        self.direct.local_addr = Some(ip);
        self
    }

    pub fn with_direct(mut self, direct: DirectOptions) -> Self {
        self.direct = direct;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_h2_reuse(mut self, enabled: bool) -> Self {
        self.enable_h2_reuse = enabled;
        self
    }

    pub fn with_http2_prior_knowledge(mut self, enabled: bool) -> Self {
        self.http2_prior_knowledge = enabled;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_tls_dialer(mut self, dialer: Arc<dyn TlsDial>) -> Self {
        self.tls_dialer = Some(dialer);
        self
    }

    pub fn with_transport_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.transport_connector = Some(connector);
        self
    }
}

impl fmt::Debug for DialerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialerOptions")
            .field("direct", &self.direct)
            .field("headers", &self.headers.len())
            .field("enable_h2_reuse", &self.enable_h2_reuse)
            .field("http2_prior_knowledge", &self.http2_prior_knowledge)
            .field("insecure", &self.insecure)
            .field("custom_tls", &self.tls_dialer.is_some())
            .field("custom_transport", &self.transport_connector.is_some())
            .finish()
    }
}

/// Dialer for a proxy URL.
///
/// `http`/`https` proxies tunnel through CONNECT; `socks5`/`socks5h` go
/// through the SOCKS5 adapter.
pub enum ProxyDialer {
    Connect(ConnectDialer),
    Socks(SocksDialer),
}

impl ProxyDialer {
    /// Parse `proxy_url` and build the matching dialer.
    pub fn new(proxy_url: &str, options: DialerOptions) -> Result<Self> {
        let proxy = ProxyUrl::parse(proxy_url)?;
        Self::from_proxy(proxy, options)
    }

    pub fn from_proxy(proxy: ProxyUrl, options: DialerOptions) -> Result<Self> {
        match proxy.scheme() {
            ProxyScheme::Http | ProxyScheme::Https => {
                Ok(ProxyDialer::Connect(ConnectDialer::new(proxy, options)?))
            }
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => Ok(ProxyDialer::Socks(
                SocksDialer::new(proxy, DirectDialer::new(options.direct)?)?,
            )),
        }
    }

    pub fn proxy(&self) -> &ProxyUrl {
        match self {
            ProxyDialer::Connect(d) => d.proxy(),
            ProxyDialer::Socks(d) => d.proxy(),
        }
    }
}

#[async_trait]
impl ContextDialer for ProxyDialer {
    type Conn = TunnelConn;

    async fn dial_context(
        &self,
        ctx: &DialContext,
        network: Network,
        addr: &Addr,
    ) -> Result<TunnelConn> {
        match self {
            ProxyDialer::Connect(d) => d.dial_context(ctx, network, addr).await,
            ProxyDialer::Socks(d) => d
                .dial_context(ctx, network, addr)
                .await
                .map(TunnelConn::Socks),
        }
    }
}

impl fmt::Debug for ProxyDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyDialer").field(&self.proxy().to_string()).finish()
    }
}
