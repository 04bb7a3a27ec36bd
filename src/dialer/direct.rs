//! Direct TCP dialer.
//!
//! Connects to the target using the local network.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::context::DialContext;
use crate::error::{ConnectErrorKind, Result, TunnelError};
use crate::types::{Addr, Network};

use super::{ContextDialer, DEFAULT_DIALER_TIMEOUT};

/// Options for creating a [`DirectDialer`].
#[derive(Debug, Clone)]
pub struct DirectOptions {
    /// Overall connection timeout, covering resolution and every candidate
    pub timeout: Duration,
    /// Local source address for outgoing connections
    pub local_addr: Option<IpAddr>,
    /// Bind to a specific network device (Linux only, SO_BINDTODEVICE).
    /// Mutually exclusive with local_addr.
    pub bind_device: Option<String>,
    /// Enable TCP Fast Open
    pub fast_open: bool,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIALER_TIMEOUT,
            local_addr: None,
            bind_device: None,
            fast_open: false,
        }
    }
}

impl DirectOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_local_addr(mut self, ip: IpAddr) -> Self {
        self.local_addr = Some(ip);
        self
    }

    pub fn with_bind_device(mut self, device: impl Into<String>) -> Self {
        self.bind_device = Some(device.into());
        self
    }

    pub fn with_fast_open(mut self, enabled: bool) -> Self {
        self.fast_open = enabled;
        self
    }
}

/// Dialer that connects directly to the target.
///
/// IP literals are used as-is; hostnames go through the system resolver.
/// Candidates are tried in order until one connects.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    timeout: Duration,
    local_addr: Option<IpAddr>,
    bind_device: Option<String>,
    fast_open: bool,
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIALER_TIMEOUT,
            local_addr: None,
            bind_device: None,
            fast_open: false,
        }
    }
}

impl DirectDialer {
    /// Create a new DirectDialer with the given options.
    pub fn new(opts: DirectOptions) -> Result<Self> {
        if opts.bind_device.is_some() && opts.local_addr.is_some() {
            return Err(TunnelError::ConfigError(
                "bind_device is mutually exclusive with local_addr".to_string(),
            ));
        }
        if opts.timeout.is_zero() {
            return Err(TunnelError::ConfigError(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            timeout: opts.timeout,
            local_addr: opts.local_addr,
            bind_device: opts.bind_device,
            fast_open: opts.fast_open,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the address and keep the IPs usable on `network` and from the
    /// local address family.
    pub(crate) async fn resolve(&self, network: Network, addr: &Addr) -> Result<Vec<IpAddr>> {
        let ips: Vec<IpAddr> = match addr.ip() {
            Some(ip) => vec![ip],
            None => tokio::net::lookup_host((addr.host.as_str(), addr.port))
                .await
                .map_err(|e| {
                    TunnelError::connect(
                        ConnectErrorKind::DnsFailed,
                        format!("failed to resolve {}: {}", addr.host, e),
                    )
                })?
                .map(|sock| sock.ip())
                .collect(),
        };

        let candidates: Vec<IpAddr> = ips
            .into_iter()
            .filter(|ip| network.allows(ip))
            .filter(|ip| match self.local_addr {
                Some(local) => local.is_ipv4() == ip.is_ipv4(),
                None => true,
            })
            .collect();

        if candidates.is_empty() {
            return Err(TunnelError::connect(
                ConnectErrorKind::DnsFailed,
                format!("no suitable address found for {} on {}", addr.host, network),
            ));
        }
        Ok(candidates)
    }

    /// Check if we need to create a socket2::Socket for custom options.
    fn needs_custom_socket(&self) -> bool {
        self.local_addr.is_some() || self.bind_device.is_some() || self.fast_open
    }

    /// Create and configure a TCP socket2::Socket with all custom options.
    fn create_tcp_socket(&self, ip: &IpAddr) -> Result<socket2::Socket> {
        let domain = match ip {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| {
                    TunnelError::connect(
                        ConnectErrorKind::ConnectionFailed,
                        format!("Failed to create socket: {}", e),
                    )
                })?;

        if let Some(local) = self.local_addr {
            socket
                .bind(&SocketAddr::new(local, 0).into())
                .map_err(|e| {
                    TunnelError::connect(
                        ConnectErrorKind::ConnectionFailed,
                        format!("Failed to bind {}: {}", local, e),
                    )
                })?;
        }

        #[cfg(target_os = "linux")]
        if let Some(ref device) = self.bind_device {
            socket.bind_device(Some(device.as_bytes())).map_err(|e| {
                TunnelError::connect(
                    ConnectErrorKind::ConnectionFailed,
                    format!("Failed to bind device {}: {}", device, e),
                )
            })?;
        }

        if self.fast_open {
            set_tcp_fastopen(&socket)?;
        }

        socket.set_nonblocking(true).map_err(|e| {
            TunnelError::connect(
                ConnectErrorKind::ConnectionFailed,
                format!("Failed to set nonblocking: {}", e),
            )
        })?;
        Ok(socket)
    }

    async fn connect_ip(&self, target: SocketAddr) -> Result<TcpStream> {
        let connect_err = |e: std::io::Error| {
            TunnelError::connect(
                ConnectErrorKind::ConnectionFailed,
                format!("Failed to connect to {}: {}", target, e),
            )
        };

        if self.needs_custom_socket() {
            let socket = self.create_tcp_socket(&target.ip())?;
            let std_stream: std::net::TcpStream = socket.into();
            let tokio_socket = tokio::net::TcpSocket::from_std_stream(std_stream);
            tokio_socket.connect(target).await.map_err(connect_err)
        } else {
            TcpStream::connect(target).await.map_err(connect_err)
        }
    }

    async fn dial_candidates(&self, network: Network, addr: &Addr) -> Result<TcpStream> {
        let candidates = self.resolve(network, addr).await?;
        let mut last_err = None;
        for ip in candidates {
            let sock = SocketAddr::new(ip, addr.port);
            match self.connect_ip(sock).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(addr = %sock, error = %e, "direct dial candidate failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            TunnelError::connect(
                ConnectErrorKind::ConnectionFailed,
                format!("no address to dial for {}", addr),
            )
        }))
    }
}

#[async_trait]
impl ContextDialer for DirectDialer {
    type Conn = TcpStream;

    async fn dial_context(
        &self,
        ctx: &DialContext,
        network: Network,
        addr: &Addr,
    ) -> Result<TcpStream> {
        if ctx.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        debug!(addr = %addr, %network, "direct dial");

        tokio::select! {
            res = tokio::time::timeout(self.timeout, self.dial_candidates(network, addr)) => {
                res.map_err(|_| {
                    TunnelError::connect(
                        ConnectErrorKind::Timeout,
                        format!("Connection to {} timed out", addr),
                    )
                })?
            }
            _ = ctx.cancelled() => Err(TunnelError::Cancelled),
        }
    }
}

/// Enable TCP Fast Open on a socket.
///
/// - Linux: uses `TCP_FASTOPEN_CONNECT` (enables TFO for client connect() calls)
/// - macOS: uses `TCP_FASTOPEN`
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn set_tcp_fastopen(socket: &socket2::Socket) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    #[cfg(target_os = "linux")]
    const TFO_OPT: libc::c_int = 30; // TCP_FASTOPEN_CONNECT

    #[cfg(target_os = "macos")]
    const TFO_OPT: libc::c_int = libc::TCP_FASTOPEN;

    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            TFO_OPT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(TunnelError::connect(
            ConnectErrorKind::ConnectionFailed,
            format!(
                "Failed to set TCP Fast Open: {}",
                std::io::Error::last_os_error()
            ),
        ));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_tcp_fastopen(_socket: &socket2::Socket) -> Result<()> {
    Err(TunnelError::ConfigError(
        "TCP Fast Open is not supported on this platform".to_string(),
    ))
}
