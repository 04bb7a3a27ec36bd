//! SOCKS5 proxy dialer.
//!
//! The handshake itself is done by `tokio-socks`; this adapter only reaches
//! the proxy and chooses where the target gets resolved.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::context::DialContext;
use crate::error::{ConnectErrorKind, Result, TunnelError};
use crate::proxy::{Credentials, ProxyScheme, ProxyUrl};
use crate::types::{Addr, Network};

use super::{ContextDialer, DirectDialer};

/// RFC 1929 limit for username and password
const MAX_CREDENTIAL_LEN: usize = 255;

/// SOCKS5 tunnel dialer.
///
/// `socks5://` resolves the target locally and sends an IP to the proxy;
/// `socks5h://` sends the hostname for the proxy to resolve.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy: ProxyUrl,
    direct: DirectDialer,
    timeout: Duration,
}

impl SocksDialer {
    pub fn new(proxy: ProxyUrl, direct: DirectDialer) -> Result<Self> {
        if !proxy.scheme().is_socks() {
            return Err(TunnelError::UnsupportedScheme(
                proxy.scheme().as_str().to_string(),
            ));
        }
        if let Some(credentials) = proxy.credentials() {
            if credentials.username.is_empty()
                || credentials.password.is_empty()
                || credentials.username.len() > MAX_CREDENTIAL_LEN
                || credentials.password.len() > MAX_CREDENTIAL_LEN
            {
                return Err(TunnelError::InvalidProxyUrl {
                    url: proxy.to_string(),
                    message: "SOCKS5 username and password must be 1 to 255 bytes".to_string(),
                });
            }
        }
        let timeout = direct.timeout();
        Ok(Self {
            proxy,
            direct,
            timeout,
        })
    }

    pub fn proxy(&self) -> &ProxyUrl {
        &self.proxy
    }

    async fn local_target(&self, network: Network, addr: &Addr) -> Result<SocketAddr> {
        let ips = self.direct.resolve(network, addr).await?;
        ips.first()
            .map(|ip| SocketAddr::new(*ip, addr.port))
            .ok_or_else(|| {
                TunnelError::connect(
                    ConnectErrorKind::DnsFailed,
                    format!("no address found for {}", addr.host),
                )
            })
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        network: Network,
        addr: &Addr,
    ) -> Result<TcpStream> {
        let credentials = self.proxy.credentials();
        let socks = match self.proxy.scheme() {
            ProxyScheme::Socks5 => {
                let target = self.local_target(network, addr).await?;
                connect(stream, target, credentials).await
            }
            _ => connect(stream, (addr.host.as_str(), addr.port), credentials).await,
        };
        socks.map_err(|e| {
            TunnelError::connect(
                ConnectErrorKind::Socks,
                format!("SOCKS5 connect to {} via {} failed: {}", addr, self.proxy.addr(), e),
            )
        })
    }
}

async fn connect<'t, T>(
    stream: TcpStream,
    target: T,
    credentials: Option<&Credentials>,
) -> std::result::Result<TcpStream, tokio_socks::Error>
where
    T: tokio_socks::IntoTargetAddr<'t>,
{
    let socks = match credentials {
        Some(c) => {
            Socks5Stream::connect_with_password_and_socket(stream, target, &c.username, &c.password)
                .await?
        }
        None => Socks5Stream::connect_with_socket(stream, target).await?,
    };
    Ok(socks.into_inner())
}

#[async_trait]
impl ContextDialer for SocksDialer {
    type Conn = TcpStream;

    async fn dial_context(
        &self,
        ctx: &DialContext,
        network: Network,
        addr: &Addr,
    ) -> Result<TcpStream> {
        debug!(proxy = %self.proxy.addr(), addr = %addr, "SOCKS5 dial");
        let stream = self.direct.dial_context(ctx, network, self.proxy.addr()).await?;

        tokio::select! {
            res = tokio::time::timeout(self.timeout, self.handshake(stream, network, addr)) => {
                res.map_err(|_| {
                    TunnelError::connect(
                        ConnectErrorKind::Timeout,
                        format!("SOCKS5 handshake with {} timed out", self.proxy.addr()),
                    )
                })?
            }
            _ = ctx.cancelled() => Err(TunnelError::Cancelled),
        }
    }
}
