use thiserror::Error;

/// Broad error class, used by callers to decide whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad proxy URL, scheme, address or option. Never retryable.
    Config,
    /// Connecting, TLS, HTTP/2 or SOCKS5 establishment failed
    Transport,
    /// The proxy negotiated an application protocol we cannot speak
    Negotiation,
    /// The proxy answered the CONNECT request with a non-200 status
    ProxyRejected,
    /// The caller cancelled the dial
    Cancelled,
    /// I/O error on an established transport, including deadline expiry
    Io,
}

/// Classifies transport establishment errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Connection to the remote host failed
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// DNS resolution failed
    DnsFailed,
    /// TLS handshake with the proxy failed
    Tls,
    /// HTTP/2 handshake or stream error
    Http2,
    /// SOCKS5 negotiation failed
    Socks,
}

/// Tunnel dialer error types
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid proxy url `{url}`: {message}")]
    InvalidProxyUrl { url: String, message: String },

    #[error("Scheme {0} is not supported")]
    UnsupportedScheme(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Connect error: {message}")]
    ConnectError {
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("Negotiated unsupported application layer protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Proxy responded with non 200 code: {status}")]
    ProxyRejected { status: String },

    #[error("Dial cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TunnelError {
    pub(crate) fn connect(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        TunnelError::ConnectError {
            kind,
            message: message.into(),
        }
    }

    /// Map the error onto its broad class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::InvalidProxyUrl { .. }
            | TunnelError::UnsupportedScheme(_)
            | TunnelError::UnsupportedNetwork(_)
            | TunnelError::InvalidAddress(_)
            | TunnelError::ConfigError(_) => ErrorKind::Config,
            TunnelError::ConnectError { .. } => ErrorKind::Transport,
            TunnelError::UnsupportedProtocol(_) => ErrorKind::Negotiation,
            TunnelError::ProxyRejected { .. } => ErrorKind::ProxyRejected,
            TunnelError::Cancelled => ErrorKind::Cancelled,
            TunnelError::IoError(_) => ErrorKind::Io,
        }
    }

    /// True when the error is an I/O deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            TunnelError::ConnectError { kind, .. } => *kind == ConnectErrorKind::Timeout,
            TunnelError::IoError(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
