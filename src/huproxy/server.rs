//! HTTP front end: maps tunnel requests onto [`Negotiator`] and runs each session in its own task.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::huproxy::{
    net, telemetry,
    tunnel::{
        error::SetupError,
        negotiate::{Dialed, Negotiator, TunnelConfig},
        relay,
        target::{self, Target},
        ws::WsUpgrade,
    },
};

/// Header carrying `host:port` for requests on the bare `/{url}` route.
pub const CONNECT_HEADER: &str = "connect";

pub struct ServerState {
    pub negotiator: Negotiator,
    pub tunnels: telemetry::SharedTunnels,
}

impl ServerState {
    pub fn new(tunnel: TunnelConfig, tunnels: telemetry::SharedTunnels) -> Self {
        Self {
            negotiator: Negotiator::tcp(tunnel),
            tunnels,
        }
    }
}

/// Routes `GET /{url}/{host}/{port}` and `GET /{url}` (with a `Connect` header).
pub fn router(url: &str, state: Arc<ServerState>) -> Router {
    let base = format!("/{url}");
    Router::new()
        .route(&format!("{base}/{{host}}/{{port}}"), get(tunnel_by_path))
        .route(&base, get(tunnel_by_header))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    url: &str,
    state: Arc<ServerState>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = net::normalize_bind_addr(listen_addr);
    let listener = TcpListener::bind(addr.as_ref())
        .await
        .with_context(|| format!("bind {addr}"))?;

    tracing::info!(listen_addr = %addr, url = %url, "huproxy: listening");

    serve_listener(listener, url, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    url: &str,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(url, state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|v| *v).await;
    })
    .await
    .context("huproxy: serve")?;
    Ok(())
}

async fn tunnel_by_path(
    State(st): State<Arc<ServerState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Path((host, port)): Path<(String, String)>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (host, port) = target::resolve(connect_header(&headers), Some((host, port)));
    handle_tunnel_request(st, client, &host, &port, ws).await
}

async fn tunnel_by_header(
    State(st): State<Arc<ServerState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (host, port) = target::resolve(connect_header(&headers), None);
    handle_tunnel_request(st, client, &host, &port, ws).await
}

fn connect_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONNECT_HEADER).and_then(|v| v.to_str().ok())
}

/// Validate the target, dial it, and only then commit the upgrade.
///
/// Setup failures are answered with a plain status. On success the `101` response is returned
/// and the session continues in a spawned task.
pub async fn handle_tunnel_request(
    st: Arc<ServerState>,
    client: SocketAddr,
    host: &str,
    port: &str,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let sid = telemetry::new_session_id();

    let target = match Target::new(host, port) {
        Ok(t) => t,
        Err(err) => return reject(&sid, client, err),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rej) => return reject(&sid, client, SetupError::UpgradeFailed(rej.body_text())),
    };

    let dialed = match st.negotiator.dial(&sid, target).await {
        Ok(d) => d,
        Err(err) => return reject(&sid, client, err),
    };

    let (upgrade, response) = WsUpgrade::accept(ws, &sid);
    tokio::spawn(run_session(st, sid, client, dialed, upgrade));
    response
}

fn reject(sid: &str, client: SocketAddr, err: SetupError) -> Response {
    telemetry::record_setup_failure(err.reason());
    tracing::warn!(sid = %sid, client = %client, err = %err, "tunnel: rejected");
    (err.status_code(), err.to_string()).into_response()
}

async fn run_session(
    st: Arc<ServerState>,
    sid: String,
    client: SocketAddr,
    dialed: Dialed<tokio::net::TcpStream>,
    upgrade: WsUpgrade,
) {
    let target = dialed.target().to_string();

    let session = match dialed.upgrade(upgrade).await {
        Ok(s) => s,
        Err(err) => {
            telemetry::record_setup_failure(err.reason());
            tracing::warn!(sid = %sid, client = %client, target = %target, err = %err, "tunnel: upgrade failed");
            return;
        }
    };

    st.tunnels.add(telemetry::TunnelInfo {
        id: sid.clone(),
        client: client.to_string(),
        target: target.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    let active = telemetry::ActiveTunnelGuard::new();

    tracing::info!(sid = %sid, client = %client, target = %target, "tunnel: established");

    let summary = relay::run(session).await;

    drop(active);
    st.tunnels.remove(&sid);
    telemetry::record_bytes(summary.bytes_to_target, summary.bytes_from_target);

    tracing::info!(
        sid = %sid,
        target = %target,
        bytes_to_target = summary.bytes_to_target,
        bytes_from_target = summary.bytes_from_target,
        faulted = summary.faulted,
        "tunnel: closed"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{
            Message as WsMessage,
            client::IntoClientRequest,
            http::HeaderValue,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    };

    use super::*;

    struct TestServer {
        addr: SocketAddr,
        tunnels: telemetry::SharedTunnels,
        _shutdown: watch::Sender<bool>,
    }

    async fn start_server() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tunnels = Arc::new(telemetry::TunnelRegistry::new());
        let state = Arc::new(ServerState::new(
            TunnelConfig {
                dial_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                write_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            tunnels.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = serve_listener(listener, "proxy", state, rx).await;
        });
        TestServer {
            addr,
            tunnels,
            _shutdown: tx,
        }
    }

    /// Port of a listener that has already been closed, so dialing it is refused.
    async fn closed_port() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().port()
    }

    /// Sends a raw upgrade request and returns the response status code.
    async fn raw_status(addr: SocketAddr, path: &str, extra: &str, upgrade: bool) -> u16 {
        let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
        let upgrade_headers = if upgrade {
            "Connection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"
        } else {
            ""
        };
        let req = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n{upgrade_headers}{extra}\r\n");
        s.write_all(req.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        while !buf.windows(2).any(|w| w == b"\r\n") {
            let n = s.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before status line");
            buf.extend_from_slice(&chunk[..n]);
        }
        let line = String::from_utf8_lossy(&buf);
        line.split_whitespace()
            .nth(1)
            .and_then(|c| c.parse().ok())
            .expect("status code")
    }

    #[tokio::test]
    async fn binary_messages_are_echoed_through_target() {
        let srv = start_server().await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let (mut ws, _) = connect_async(format!("ws://{}/proxy/127.0.0.1/{port}", srv.addr))
            .await
            .expect("connect");

        ws.send(WsMessage::binary(b"ping".to_vec())).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 4 {
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(WsMessage::Binary(b)))) => got.extend_from_slice(&b),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(got, b"ping");
        assert_eq!(srv.tunnels.len(), 1);

        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn connect_header_selects_target() {
        let srv = start_server().await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let accepted = tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut req = format!("ws://{}/proxy", srv.addr)
            .into_client_request()
            .unwrap();
        req.headers_mut().insert(
            "Connect",
            HeaderValue::from_str(&format!("127.0.0.1:{port}")).unwrap(),
        );

        let (mut ws, _) = connect_async(req).await.expect("connect");
        ws.send(WsMessage::binary(b"abc".to_vec())).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), accepted)
            .await
            .expect("target reached")
            .unwrap();
        assert_eq!(&got, b"abc");
    }

    #[tokio::test]
    async fn target_eof_sends_data_then_normal_close() {
        let srv = start_server().await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            s.write_all(b"hello").await.unwrap();
            s.shutdown().await.unwrap();
            let mut sink = Vec::new();
            let _ = s.read_to_end(&mut sink).await;
        });

        let (mut ws, _) = connect_async(format!("ws://{}/proxy/127.0.0.1/{port}", srv.addr))
            .await
            .expect("connect");

        let mut got = Vec::new();
        let code = loop {
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(WsMessage::Binary(b)))) => got.extend_from_slice(&b),
                Ok(Some(Ok(WsMessage::Close(frame)))) => break frame.map(|f| f.code),
                other => panic!("unexpected: {other:?}"),
            }
        };
        assert_eq!(got, b"hello");
        assert_eq!(code, Some(CloseCode::Normal));
    }

    #[tokio::test]
    async fn client_close_is_answered() {
        let srv = start_server().await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = s.read_to_end(&mut sink).await;
        });

        let (mut ws, _) = connect_async(format!("ws://{}/proxy/127.0.0.1/{port}", srv.addr))
            .await
            .expect("connect");

        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))
        .await
        .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                assert_eq!(frame.map(|f| f.code), Some(CloseCode::Normal));
            }
            other => panic!("close not answered: {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_message_aborts_session() {
        let srv = start_server().await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let target_side = tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.map(|_| buf)
        });

        let (mut ws, _) = connect_async(format!("ws://{}/proxy/127.0.0.1/{port}", srv.addr))
            .await
            .expect("connect");
        ws.send(WsMessage::text("nope")).await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(2), target_side)
            .await
            .expect("target connection torn down")
            .unwrap();
        if let Ok(buf) = res {
            assert!(buf.is_empty(), "no bytes relayed for a text message");
        }

        // Wait for the session task to deregister.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while srv.tunnels.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(srv.tunnels.len(), 0);
    }

    #[tokio::test]
    async fn missing_target_is_bad_request() {
        let srv = start_server().await;
        assert_eq!(raw_status(srv.addr, "/proxy", "", true).await, 400);
        assert_eq!(
            raw_status(srv.addr, "/proxy", "Connect: no-port-here\r\n", true).await,
            400
        );
    }

    #[tokio::test]
    async fn unreachable_target_is_service_unavailable() {
        let srv = start_server().await;
        let port = closed_port().await;
        let path = format!("/proxy/127.0.0.1/{port}");
        assert_eq!(raw_status(srv.addr, &path, "", true).await, 503);
        assert_eq!(srv.tunnels.len(), 0);
    }

    #[tokio::test]
    async fn plain_request_is_rejected_before_dialing() {
        let srv = start_server().await;

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let path = format!("/proxy/127.0.0.1/{port}");

        assert_eq!(raw_status(srv.addr, &path, "", false).await, 502);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), target.accept())
                .await
                .is_err(),
            "target must not be dialed"
        );
    }
}
