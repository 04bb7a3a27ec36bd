//! CONNECT tunnel dialer tests with in-memory proxies.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use proxy_tunnel_r::{
    Addr, BoxedStream, ConnectDialer, ConnectRequest, ConnectResponse, ContextDialer,
    DialContext, DialerOptions, ErrorKind, MultiplexedTransport, Network, ProxyDialer, ProxyUrl,
    RequestBody, Result, TlsDial, TransportConnector, TunnelConn, TunnelError,
};

/// TLS dialer handing out in-memory streams; the proxy ends go to the test.
struct StubTls {
    protocol: &'static str,
    dials: AtomicUsize,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl StubTls {
    fn new(protocol: &'static str) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tls = Arc::new(Self {
            protocol,
            dials: AtomicUsize::new(0),
            peers: tx,
        });
        (tls, rx)
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TlsDial for StubTls {
    async fn dial_tls(&self, _network: Network, _addr: &Addr) -> Result<(BoxedStream, String)> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _ = self.peers.send(server);
        Ok((Box::new(client), self.protocol.to_string()))
    }
}

/// TLS dialer that never completes.
struct HangingTls;

#[async_trait]
impl TlsDial for HangingTls {
    async fn dial_tls(&self, _network: Network, _addr: &Addr) -> Result<(BoxedStream, String)> {
        std::future::pending().await
    }
}

/// Multiplexed transport that echoes the request body as the response body.
struct StubTransport {
    status: StatusCode,
    broken: AtomicBool,
    rejecting: AtomicBool,
    stalled: AtomicBool,
    round_trips: AtomicUsize,
    closes: AtomicUsize,
    last_request: Mutex<Option<ConnectRequest>>,
}

impl StubTransport {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            broken: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            round_trips: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MultiplexedTransport for StubTransport {
    fn can_accept_new_stream(&self) -> bool {
        true
    }

    async fn round_trip(
        &self,
        req: ConnectRequest,
        mut body: RequestBody,
    ) -> Result<ConnectResponse> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TunnelError::IoError(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stub transport broken",
            )));
        }
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        *self.last_request.lock().unwrap() = Some(req);

        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            while let Some(chunk) = body.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        let status = if self.rejecting.load(Ordering::SeqCst) {
            StatusCode::FORBIDDEN
        } else {
            self.status
        };
        Ok(ConnectResponse {
            status,
            body: Box::new(reader),
        })
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct StubConnector {
    status: StatusCode,
    stall: AtomicBool,
    transports: Mutex<Vec<Arc<StubTransport>>>,
}

impl StubConnector {
    fn new(status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            status,
            stall: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
        })
    }

    fn transport(&self, i: usize) -> Arc<StubTransport> {
        self.transports.lock().unwrap()[i].clone()
    }

    fn connects(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportConnector for StubConnector {
    async fn connect(&self, _io: BoxedStream) -> Result<Arc<dyn MultiplexedTransport>> {
        let transport = Arc::new(StubTransport::new(self.status));
        transport
            .stalled
            .store(self.stall.load(Ordering::SeqCst), Ordering::SeqCst);
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "unexpected EOF while reading request head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn target() -> Addr {
    Addr::new("target.example", 443)
}

fn h2_dialer(
    url: &str,
    reuse: bool,
    status: StatusCode,
) -> (ConnectDialer, Arc<StubTls>, Arc<StubConnector>) {
    let (tls, _peers) = StubTls::new("h2");
    let connector = StubConnector::new(status);
    let options = DialerOptions::default()
        .with_h2_reuse(reuse)
        .with_tls_dialer(tls.clone())
        .with_transport_connector(connector.clone());
    let dialer = ConnectDialer::new(ProxyUrl::parse(url).unwrap(), options).unwrap();
    (dialer, tls, connector)
}

#[tokio::test]
async fn test_http1_connect_request_with_basic_auth() {
    let (tls, mut peers) = StubTls::new("http/1.1");
    let dialer = ProxyDialer::new(
        "https://user:pw@proxy.example:443",
        DialerOptions::default().with_tls_dialer(tls.clone()),
    )
    .unwrap();

    let proxy = tokio::spawn(async move {
        let mut peer = peers.recv().await.unwrap();
        let head = read_head(&mut peer).await;
        peer.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        peer.write_all(b"pong").await.unwrap();
        head
    });

    let mut conn = dialer.dial(Network::Tcp, &target()).await.unwrap();
    assert!(matches!(conn, TunnelConn::Plain(_)));
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    let head = proxy.await.unwrap();
    assert_eq!(
        head,
        "CONNECT target.example:443 HTTP/1.1\r\n\
         Host: target.example:443\r\n\
         Proxy-Authorization: Basic dXNlcjpwdw==\r\n\
         \r\n"
    );
    assert_eq!(tls.dials(), 1);
}

#[tokio::test]
async fn test_http1_replays_bytes_after_response_head() {
    let (tls, mut peers) = StubTls::new("");
    let dialer = ProxyDialer::new(
        "https://proxy.example",
        DialerOptions::default().with_tls_dialer(tls),
    )
    .unwrap();

    tokio::spawn(async move {
        let mut peer = peers.recv().await.unwrap();
        read_head(&mut peer).await;
        peer.write_all(b"HTTP/1.1 200 OK\r\nVia: stub\r\n\r\nearly data")
            .await
            .unwrap();
        // Keep the stream open until the client is done
        let mut sink = Vec::new();
        let _ = peer.read_to_end(&mut sink).await;
    });

    let mut conn = dialer.dial(Network::Tcp, &target()).await.unwrap();
    let mut buf = [0u8; 10];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"early data");
}

#[tokio::test]
async fn test_http1_non_200_closes_transport() {
    let (tls, mut peers) = StubTls::new("http/1.1");
    let dialer = ProxyDialer::new(
        "https://proxy.example:443",
        DialerOptions::default().with_tls_dialer(tls),
    )
    .unwrap();

    let proxy = tokio::spawn(async move {
        let mut peer = peers.recv().await.unwrap();
        read_head(&mut peer).await;
        peer.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        peer.read(&mut buf).await.unwrap()
    });

    let err = dialer.dial(Network::Tcp, &target()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProxyRejected);
    assert!(
        err.to_string().contains("407 Proxy Authentication Required"),
        "got: {}",
        err
    );
    // Proxy sees EOF once the transport is dropped
    assert_eq!(proxy.await.unwrap(), 0);
}

#[tokio::test]
async fn test_http1_deadline_exceeded() {
    let (tls, mut peers) = StubTls::new("http/1.1");
    let dialer = ProxyDialer::new(
        "https://proxy.example:443",
        DialerOptions::default()
            .with_tls_dialer(tls)
            .with_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    // Proxy reads the request and never answers
    let proxy = tokio::spawn(async move {
        let mut peer = peers.recv().await.unwrap();
        read_head(&mut peer).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let err = dialer.dial(Network::Tcp, &target()).await.unwrap_err();
    assert!(err.is_timeout(), "got: {}", err);
    assert_eq!(err.kind(), ErrorKind::Io);
    proxy.abort();
}

#[tokio::test]
async fn test_unsupported_alpn_closes_transport() {
    let (tls, mut peers) = StubTls::new("spdy/3");
    let dialer = ProxyDialer::new(
        "https://proxy.example:443",
        DialerOptions::default().with_tls_dialer(tls),
    )
    .unwrap();

    let err = dialer.dial(Network::Tcp, &target()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Negotiation);
    assert!(err.to_string().contains("spdy/3"));

    let mut peer = peers.recv().await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_h2_reuse_disabled_one_transport_per_dial() {
    let (dialer, tls, connector) = h2_dialer("https://proxy.example:443", false, StatusCode::OK);

    let mut conns = Vec::new();
    for _ in 0..3 {
        let conn = dialer.dial(Network::Tcp, &target()).await.unwrap();
        assert!(conn.is_h2());
        conns.push(conn);
    }

    assert_eq!(tls.dials(), 3);
    assert_eq!(connector.connects(), 3);
    for i in 0..3 {
        assert_eq!(connector.transport(i).round_trips(), 1);
    }
    assert!(!dialer.has_cached_transport());

    drop(conns);
    for i in 0..3 {
        assert_eq!(connector.transport(i).closes(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_h2_concurrent_dials_share_one_transport() {
    let (dialer, tls, connector) = h2_dialer("https://proxy.example:443", true, StatusCode::OK);
    let dialer = Arc::new(dialer);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let dialer = dialer.clone();
        handles.push(tokio::spawn(async move {
            dialer.dial(Network::Tcp, &target()).await
        }));
    }

    let mut conns = Vec::new();
    for handle in handles {
        conns.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(tls.dials(), 1);
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.transport(0).round_trips(), 8);
    assert!(dialer.has_cached_transport());

    // Cache still holds the transport after every stream ends
    drop(conns);
    assert_eq!(connector.transport(0).closes(), 0);
    dialer.clear_cache();
    assert_eq!(connector.transport(0).closes(), 1);
}

#[tokio::test]
async fn test_h2_non_200_closes_transport_once() {
    let (dialer, _tls, connector) =
        h2_dialer("https://proxy.example:443", true, StatusCode::FORBIDDEN);

    let err = dialer.dial(Network::Tcp, &target()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProxyRejected);
    assert!(err.to_string().contains("403 Forbidden"), "got: {}", err);

    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.transport(0).closes(), 1);
    assert!(!dialer.has_cached_transport());
}

#[tokio::test]
async fn test_h2_tunnel_bytes_in_order() {
    let (dialer, _tls, _connector) =
        h2_dialer("https://proxy.example:443", true, StatusCode::OK);

    let conn = dialer.dial(Network::Tcp, &target()).await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(conn);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let write = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    reader.read_to_end(&mut received).await.unwrap();
    write.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_h2_close_write_twice_is_noop() {
    let (dialer, _tls, _connector) =
        h2_dialer("https://proxy.example:443", true, StatusCode::OK);

    let conn = dialer.dial(Network::Tcp, &target()).await.unwrap();
    let TunnelConn::H2(mut conn) = conn else {
        panic!("expected HTTP/2 tunnel");
    };
    conn.write_all(b"bye").await.unwrap();
    conn.close_write().unwrap();
    conn.close_write().unwrap();

    let mut out = Vec::new();
    conn.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"bye");

    let err = conn.write(b"more").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn test_cached_failure_falls_back_and_replaces_entry() {
    let (dialer, tls, connector) = h2_dialer("https://proxy.example:443", true, StatusCode::OK);

    let first = dialer.dial(Network::Tcp, &target()).await.unwrap();
    assert_eq!(connector.connects(), 1);
    connector.transport(0).broken.store(true, Ordering::SeqCst);

    let second = dialer.dial(Network::Tcp, &target()).await.unwrap();
    assert!(second.is_h2());
    assert_eq!(tls.dials(), 2);
    assert_eq!(connector.connects(), 2);
    assert!(dialer.has_cached_transport());

    // New entry serves the next dial
    let third = dialer.dial(Network::Tcp, &target()).await.unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.transport(1).round_trips(), 2);

    // Stale transport closes once its last stream ends
    assert_eq!(connector.transport(0).closes(), 0);
    drop(first);
    assert_eq!(connector.transport(0).closes(), 1);
    drop((second, third));
    assert_eq!(connector.transport(1).closes(), 0);
}

#[tokio::test]
async fn test_cached_rejection_falls_back_to_fresh_transport() {
    let (dialer, tls, connector) = h2_dialer("https://proxy.example:443", true, StatusCode::OK);

    let first = dialer.dial(Network::Tcp, &target()).await.unwrap();
    connector.transport(0).rejecting.store(true, Ordering::SeqCst);

    let second = dialer.dial(Network::Tcp, &target()).await.unwrap();
    assert!(second.is_h2());
    assert_eq!(tls.dials(), 2);
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.transport(0).round_trips(), 2);
    assert_eq!(connector.transport(1).round_trips(), 1);

    // Rejecting transport was evicted and closes with its last stream
    assert!(dialer.has_cached_transport());
    assert_eq!(connector.transport(0).closes(), 0);
    drop(first);
    assert_eq!(connector.transport(0).closes(), 1);
    drop(second);
    assert_eq!(connector.transport(1).closes(), 0);
}

#[tokio::test]
async fn test_h2_round_trip_deadline() {
    let (tls, _peers) = StubTls::new("h2");
    let connector = StubConnector::new(StatusCode::OK);
    connector.stall.store(true, Ordering::SeqCst);
    let options = DialerOptions::default()
        .with_timeout(Duration::from_millis(100))
        .with_tls_dialer(tls)
        .with_transport_connector(connector.clone());
    let dialer = ConnectDialer::new(
        ProxyUrl::parse("https://proxy.example:443").unwrap(),
        options,
    )
    .unwrap();

    let err = dialer.dial(Network::Tcp, &target()).await.unwrap_err();
    assert!(err.is_timeout(), "got: {}", err);
    assert_eq!(connector.transport(0).round_trips(), 1);
    assert_eq!(connector.transport(0).closes(), 1);
    assert!(!dialer.has_cached_transport());
}

#[tokio::test]
async fn test_per_call_headers_override_defaults() {
    let (tls, _peers) = StubTls::new("h2");
    let connector = StubConnector::new(StatusCode::OK);
    let mut defaults = HeaderMap::new();
    defaults.insert("x-client", HeaderValue::from_static("default"));
    defaults.insert("x-keep", HeaderValue::from_static("yes"));
    let options = DialerOptions::default()
        .with_headers(defaults)
        .with_tls_dialer(tls)
        .with_transport_connector(connector.clone());
    let dialer = ConnectDialer::new(
        ProxyUrl::parse("https://user:pw@proxy.example:443").unwrap(),
        options,
    )
    .unwrap();

    let mut extra = HeaderMap::new();
    extra.insert("x-client", HeaderValue::from_static("override"));
    let ctx = DialContext::new().with_headers(extra);
    let _conn = dialer
        .dial_context(&ctx, Network::Tcp, &target())
        .await
        .unwrap();

    let request = connector
        .transport(0)
        .last_request
        .lock()
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(request.authority, "target.example:443");
    let values: Vec<_> = request.headers.get_all("x-client").iter().collect();
    assert_eq!(values, vec![&HeaderValue::from_static("override")]);
    assert_eq!(request.headers["x-keep"], "yes");
    assert_eq!(
        request.headers[http::header::PROXY_AUTHORIZATION],
        "Basic dXNlcjpwdw=="
    );
    assert_eq!(dialer.default_headers()["x-client"], "default");
}

#[tokio::test]
async fn test_cancel_aborts_transport_establishment() {
    let options = DialerOptions::default().with_tls_dialer(Arc::new(HangingTls));
    let dialer = ProxyDialer::new("https://proxy.example:443", options).unwrap();

    let token = CancellationToken::new();
    let ctx = DialContext::new().with_cancellation(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let err = dialer
        .dial_context(&ctx, Network::Tcp, &target())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_plain_http_proxy_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
        head
    });

    let dialer = ProxyDialer::new(
        &format!("http://127.0.0.1:{}", port),
        DialerOptions::default(),
    )
    .unwrap();
    let mut conn = dialer
        .dial(Network::Tcp, &Addr::new("example.com", 80))
        .await
        .unwrap();
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    let head = proxy.await.unwrap();
    assert!(head.starts_with("CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\n"));
    assert!(!head.contains("Proxy-Authorization"));
}
