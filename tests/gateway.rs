//! End-to-end tests against a gateway bound to an ephemeral port, with stub
//! processes standing in for the internal app and the upstream event bus.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use hearthgate::media::MediaSupervisor;
use hearthgate::secrets::{CredentialCache, MasterKey};
use hearthgate::store::{epoch_now, SessionStore};
use hearthgate::{AppState, Config};

const SESSION_TOKEN: &str = "tok-browser";

fn seeded_store() -> SessionStore {
    let store = SessionStore::open_in_memory().unwrap();
    store
        .execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, 'user-1', ?2)",
            &[&SESSION_TOKEN, &(epoch_now() + 3600)],
        )
        .unwrap();
    store
}

/// Bind the gateway on an ephemeral port and return its address.
async fn spawn_gateway(app_port: u16, store: SessionStore) -> SocketAddr {
    let mut config = Config::default();
    config.server.app_port = app_port;
    spawn_gateway_with(config, store).await
}

async fn spawn_gateway_with(mut config: Config, store: SessionStore) -> SocketAddr {
    // Point the media binary somewhere that never exists so the supervisor
    // stays idle throughout.
    config.media.binary_path = "/nonexistent/media-relay".to_string();

    let media = MediaSupervisor::new(config.media.clone());
    let state = AppState::new(
        config,
        store,
        CredentialCache::new(MasterKey::from_bytes([42u8; 32])),
        media,
    );
    let app = hearthgate::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Stub internal app: answers every request with 201, echoing the body and
/// the received X-Forwarded-For header.
async fn spawn_stub_app() -> u16 {
    let app = Router::new().fallback(
        |headers: axum::http::HeaderMap, body: Bytes| async move {
            let xff = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            (
                axum::http::StatusCode::CREATED,
                [("x-seen-forwarded-for", xff)],
                body,
            )
        },
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn test_http_proxied_to_app_with_forwarded_headers() {
    let app_port = spawn_stub_app().await;
    let addr = spawn_gateway(app_port, seeded_store()).await;

    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let req = hyper::Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/api/items?page=2"))
        .body(Full::new(Bytes::from_static(b"payload-bytes")))
        .unwrap();

    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), 201);
    let xff = response
        .headers()
        .get("x-seen-forwarded-for")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(xff, "127.0.0.1");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"payload-bytes");
}

#[tokio::test]
async fn test_http_502_when_app_down() {
    // A port with nothing behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);
    let addr = spawn_gateway(dead_port, seeded_store()).await;

    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let req = hyper::Request::builder()
        .uri(format!("http://{addr}/"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_production_post_origin_is_enforced() {
    let app_port = spawn_stub_app().await;
    let mut config = Config::default();
    config.server.app_port = app_port;
    config.security.production = true;
    config.security.allowed_origins = vec!["home.example.com".into()];
    let addr = spawn_gateway_with(config, seeded_store()).await;

    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    // Foreign-origin POST never reaches the app.
    let req = hyper::Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/api/items"))
        .header("origin", "https://evil.example.org")
        .body(Full::new(Bytes::from_static(b"x")))
        .unwrap();
    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), 403);

    // Allow-listed origin is proxied through.
    let req = hyper::Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/api/items"))
        .header("origin", "https://home.example.com")
        .body(Full::new(Bytes::from_static(b"x")))
        .unwrap();
    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), 201);

    // Safe methods stay exempt regardless of origin.
    let req = hyper::Request::builder()
        .uri(format!("http://{addr}/api/items"))
        .header("origin", "https://evil.example.org")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), 201);
}

#[tokio::test]
async fn test_upgrade_on_unknown_path_is_rejected() {
    let app_port = spawn_stub_app().await;
    let addr = spawn_gateway(app_port, seeded_store()).await;

    // Upgrade requests outside the gateway-owned paths never hit the app.
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/api/anything"))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ws_without_session_is_401() {
    let addr = spawn_gateway(1, seeded_store()).await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ws_with_stale_session_is_401() {
    let store = SessionStore::open_in_memory().unwrap();
    store
        .execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, 'user-1', ?2)",
            &[&SESSION_TOKEN, &(epoch_now() - 1)],
        )
        .unwrap();
    let addr = spawn_gateway(1, store).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("session={SESSION_TOKEN}").parse().unwrap(),
    );
    let err = tokio_tungstenite::connect_async(req).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ws_closes_4000_when_upstream_unconfigured() {
    let addr = spawn_gateway(1, seeded_store()).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("session={SESSION_TOKEN}").parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

    let msg = ws.next().await.unwrap().unwrap();
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4000);
            assert_eq!(frame.reason.as_str(), "upstream not configured");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// Stub event bus: runs the auth handshake, then either closes straight away
/// or answers "marco" with "polo" until the peer closes. The returned channel
/// resolves once the stub's socket has ended.
async fn spawn_stub_event_bus(close_after_auth: bool) -> (u16, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(r#"{"type":"auth_required"}"#.into()))
            .await
            .unwrap();
        let auth = ws.next().await.unwrap().unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(auth.to_text().unwrap()).unwrap();
        assert_eq!(parsed["access_token"], "llat-bus-token");
        ws.send(Message::Text(r#"{"type":"auth_ok"}"#.into()))
            .await
            .unwrap();

        if close_after_auth {
            let _ = ws.close(None).await;
        } else {
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) if text.as_str() == "marco" => {
                        ws.send(Message::Text("polo".into())).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
        // Drain so the close handshake completes, then report.
        while let Some(Ok(_)) = ws.next().await {}
        let _ = done_tx.send(());
    });
    (port, done_rx)
}

/// Store seeded with a live session and the stub bus credential (token at
/// rest as an encrypted envelope).
fn configured_store(bus_port: u16) -> SessionStore {
    let store = seeded_store();
    store
        .execute(
            "INSERT INTO system_config (key, value, encrypted) VALUES ('upstream.url', ?1, 0)",
            &[&format!("http://127.0.0.1:{bus_port}")],
        )
        .unwrap();
    let sealed = MasterKey::from_bytes([42u8; 32]).encrypt_envelope("llat-bus-token", &[5u8; 12]);
    store
        .execute(
            "INSERT INTO system_config (key, value, encrypted) VALUES ('upstream.token', ?1, 1)",
            &[&sealed],
        )
        .unwrap();
    store
}

#[tokio::test]
async fn test_relay_ready_then_bidirectional() {
    let (bus_port, bus_done) = spawn_stub_event_bus(false).await;
    let addr = spawn_gateway(1, configured_store(bus_port)).await;
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("session={SESSION_TOKEN}").parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

    // Gateway speaks first once the upstream handshake is done.
    let ready = ws.next().await.unwrap().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(ready.to_text().unwrap()).unwrap();
    assert_eq!(parsed["type"], "ready");

    // Frames flow both ways, untouched.
    ws.send(Message::Text("marco".into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "polo");

    // Browser-side close must tear the upstream side down within bounded
    // time, not just end the browser half.
    ws.close(None).await.unwrap();
    while let Some(msg) = ws.next().await {
        if msg.is_err() || matches!(msg, Ok(Message::Close(_))) {
            break;
        }
    }
    tokio::time::timeout(Duration::from_secs(5), bus_done)
        .await
        .expect("upstream socket must close after the browser leaves")
        .unwrap();
}

#[tokio::test]
async fn test_upstream_close_reaches_browser() {
    let (bus_port, _bus_done) = spawn_stub_event_bus(true).await;
    let addr = spawn_gateway(1, configured_store(bus_port)).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("session={SESSION_TOKEN}").parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

    let ready = ws.next().await.unwrap().unwrap();
    assert!(ready.to_text().unwrap().contains("ready"));

    // The bus closed right after auth; the browser must see a close, bounded.
    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("browser must see the upstream close");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_live_requires_running_media_relay() {
    let addr = spawn_gateway(1, seeded_store()).await;

    let mut req = format!("ws://{addr}/live/front_door")
        .into_client_request()
        .unwrap();
    req.headers_mut().insert(
        "cookie",
        format!("session={SESSION_TOKEN}").parse().unwrap(),
    );
    let err = tokio_tungstenite::connect_async(req).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 502),
        other => panic!("expected HTTP refusal, got {other:?}"),
    }
}
