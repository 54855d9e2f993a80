#![allow(dead_code)]

use futures::StreamExt;
use mingle_server::{build_router, AppState, Config};
use serde_json::Value;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const GRACE: Duration = Duration::from_millis(300);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    server: JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(addr.to_string(), tmp.path());
    config.max_upload_mb = 1;
    config.chat.presence_grace = GRACE;
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        addr,
        state,
        server,
        _tmp: tmp,
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Register a user, returning its id and bearer token.
    pub async fn user(&self, username: &str) -> (Uuid, String) {
        let (user, token) = self.state.add_user(username, "").await.unwrap();
        (user.id, token)
    }

    pub async fn ws(&self, token: &str) -> Ws {
        let mut req = format!("ws://{}/ws", self.addr).into_client_request().unwrap();
        req.headers_mut()
            .append("Authorization", format!("Bearer {}", token).parse().unwrap());
        let (ws, _) = connect_async(req).await.unwrap();
        ws
    }
}

/// Next JSON frame, failing the test if none arrives in time.
pub async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(txt) = msg {
            return serde_json::from_str(&txt).unwrap();
        }
    }
}

/// Skip frames until one with the given event name shows up.
pub async fn wait_for(ws: &mut Ws, name: &str) -> Value {
    loop {
        let v = next_event(ws).await;
        if v["t"] == name {
            return v;
        }
    }
}

/// Assert that no event with the given name arrives within `window`.
pub async fn assert_silent(ws: &mut Ws, name: &str, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(WsMessage::Text(txt)))) => {
                let v: Value = serde_json::from_str(&txt).unwrap();
                assert_ne!(v["t"], name, "unexpected event {v}");
            }
            Ok(Some(Ok(_))) => {}
            Ok(other) => panic!("socket ended: {other:?}"),
        }
    }
}
