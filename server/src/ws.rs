use crate::api::AppState;
use crate::error::ChatError;
use crate::registry::ConnId;
use axum::extract::ws::{Message, WebSocket};
use chat_protocol::{ClientCommand, ServerEvent, UserView};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

/// Drive one live connection until either side closes it.
pub async fn handle_socket(stream: WebSocket, state: AppState, user: UserView) {
    let coordinator = state.coordinator.clone();
    let (conn_id, mut rx) = coordinator.connection_opened(user.id).await;
    let (mut sender, mut receiver) = stream.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_command(&state, conn_id, &user, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "socket error");
                break;
            }
        }
    }

    coordinator.connection_closed(conn_id, user.id);
    writer.abort();
}

async fn handle_command(state: &AppState, conn_id: ConnId, user: &UserView, text: &str) {
    let co = &state.coordinator;
    let cmd = match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!(conn_id, error = %e, "unparseable command");
            reply_error(state, conn_id, &ChatError::InvalidInput("invalid_command"));
            return;
        }
    };
    let res = match cmd {
        ClientCommand::Join { chat_ids } => co.join_chats(conn_id, chat_ids).await.map(|chat_ids| {
            co.registry()
                .send_to(conn_id, &ServerEvent::Joined { chat_ids });
        }),
        ClientCommand::Leave { chat_id } => {
            co.leave_room(conn_id, chat_id);
            co.registry()
                .send_to(conn_id, &ServerEvent::Left { chat_id });
            Ok(())
        }
        ClientCommand::Typing { chat_id, is_typing } => co.typing(&user.id, chat_id, is_typing).await,
        ClientCommand::Delivered { message_id } => {
            co.mark_delivered(&user.id, message_id).await.map(|_| ())
        }
        ClientCommand::Read { message_id } => co.mark_read(&user.id, message_id).await.map(|_| ()),
    };
    if let Err(e) = res {
        reply_error(state, conn_id, &e);
    }
}

fn reply_error(state: &AppState, conn_id: ConnId, err: &ChatError) {
    if let ChatError::Internal(e) = err {
        warn!(conn_id, error = %e, "command failed");
    }
    state.coordinator.registry().send_to(
        conn_id,
        &ServerEvent::Error {
            error: err.code().to_string(),
        },
    );
}

/// Forward a chat's push topic to a subscriber socket.
pub async fn handle_stream(stream: WebSocket, rx: broadcast::Receiver<ServerEvent>) {
    let (mut sender, mut receiver) = stream.split();
    let mut events = BroadcastStream::new(rx);
    loop {
        tokio::select! {
            ev = events.next() => match ev {
                Some(Ok(ev)) => {
                    let Ok(text) = serde_json::to_string(&ev) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    debug!(skipped = n, "push subscriber lagging");
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
