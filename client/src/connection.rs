use anyhow::{anyhow, Context, Result};
use chat_protocol::ClientCommand;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const QUEUE: usize = 256;

/// Live socket URL for a server base URL or an explicit socket URL.
pub fn ws_url(server_url: &str) -> Result<String> {
    let url = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        server_url.to_string()
    } else {
        return Err(anyhow!("server url must start with http(s):// or ws(s)://"));
    };
    let url = url.trim_end_matches('/');
    if url.ends_with("/ws") {
        Ok(url.to_string())
    } else {
        Ok(format!("{url}/ws"))
    }
}

/// An authenticated live connection.
///
/// Frames from the server arrive on the receiver returned by [`Connection::open`]
/// as raw JSON so they can be fed to the reconciler unchanged.
pub struct Connection {
    outgoing: mpsc::Sender<Message>,
    open: Arc<AtomicBool>,
}

impl Connection {
    pub async fn open(server_url: &str, token: &str) -> Result<(Self, mpsc::Receiver<Value>)> {
        let url = ws_url(server_url)?;
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut writer, mut reader) = stream.split();
        let open = Arc::new(AtomicBool::new(true));

        let (events_tx, events_rx) = mpsc::channel(QUEUE);
        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(frame) => {
                            if events_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "dropping non-json frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket receive failed");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(QUEUE);
        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        Ok((Self { outgoing, open }, events_rx))
    }

    pub async fn send(&self, cmd: &ClientCommand) -> Result<()> {
        let text = serde_json::to_string(cmd)?;
        self.outgoing
            .send(Message::Text(text))
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    pub async fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
