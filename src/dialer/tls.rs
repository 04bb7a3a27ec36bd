//! TLS to HTTPS proxies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::conn::BoxedStream;
use crate::error::{ConnectErrorKind, Result, TunnelError};
use crate::types::{Addr, Network};

use super::{ContextDialer, DirectDialer};

/// ALPN identifier for HTTP/2
pub const ALPN_H2: &str = "h2";
/// ALPN identifier for HTTP/1.1
pub const ALPN_HTTP1: &str = "http/1.1";

/// Opens a TLS session to a proxy.
///
/// Returns the stream with the handshake complete and the negotiated ALPN
/// protocol; an empty string means none was negotiated.
#[async_trait]
pub trait TlsDial: Send + Sync {
    async fn dial_tls(&self, network: Network, addr: &Addr) -> Result<(BoxedStream, String)>;
}

/// Default [`TlsDial`] backed by rustls, offering `h2` and `http/1.1`.
///
/// The server name sent in SNI and verified against the certificate is the
/// host of the dialed address.
#[derive(Clone)]
pub struct RustlsDialer {
    direct: DirectDialer,
    connector: TlsConnector,
    timeout: Duration,
}

impl RustlsDialer {
    pub fn new(direct: DirectDialer, insecure: bool) -> Result<Self> {
        let config = Self::client_config(insecure)?;
        Ok(Self::with_config(direct, config))
    }

    /// Use a caller-built client config as is.
    pub fn with_config(direct: DirectDialer, config: ClientConfig) -> Self {
        let timeout = direct.timeout();
        Self {
            direct,
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        }
    }

    /// Client config with webpki roots and ALPN `h2`, `http/1.1`.
    pub fn client_config(insecure: bool) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::ConfigError(format!("TLS config error: {}", e)))?;

        let mut config = if insecure {
            warn!("TLS certificate verification disabled for proxy connections");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        config.alpn_protocols = vec![ALPN_H2.as_bytes().to_vec(), ALPN_HTTP1.as_bytes().to_vec()];
        Ok(config)
    }
}

#[async_trait]
impl TlsDial for RustlsDialer {
    async fn dial_tls(&self, network: Network, addr: &Addr) -> Result<(BoxedStream, String)> {
        let server_name = ServerName::try_from(addr.host.clone()).map_err(|e| {
            TunnelError::ConfigError(format!("invalid TLS server name {}: {}", addr.host, e))
        })?;

        let tcp = self.direct.dial(network, addr).await?;
        let tls = tokio::time::timeout(self.timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| {
                TunnelError::connect(
                    ConnectErrorKind::Timeout,
                    format!("TLS handshake with {} timed out", addr),
                )
            })?
            .map_err(|e| {
                TunnelError::connect(
                    ConnectErrorKind::Tls,
                    format!("TLS handshake with {} failed: {}", addr, e),
                )
            })?;

        let protocol = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        debug!(proxy = %addr, alpn = %protocol, "TLS handshake complete");

        Ok((Box::new(tls), protocol))
    }
}

/// Accepts any server certificate. Only used when explicitly configured.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
