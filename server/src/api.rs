use crate::auth::{self, Identity};
use crate::config::Config;
use crate::coordinator::{Coordinator, CreateChat, ProfileUpdate};
use crate::db::Db;
use crate::error::{ChatError, Result};
use crate::messages::{NewMessage, MAX_PAGE};
use crate::{files, ws};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::{
    body::StreamBody,
    extract::{Extension, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chat_protocol::{ChatView, MessageView, Profile, UserView};
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf};
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

const DEFAULT_PAGE: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Config,
    pub identity: Identity,
    pub coordinator: Coordinator,
    pub file_dir: PathBuf,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let file_dir = config.data_dir.join("files");
        tokio::fs::create_dir_all(&file_dir).await?;
        let db = Db::open(config.data_dir.join("mingle.db"))?;
        let secret = match &config.jwt_secret {
            Some(s) => s.as_bytes().to_vec(),
            None => auth::load_or_create_secret(&config.data_dir)?,
        };
        let identity = Identity::new(
            secret,
            time::Duration::hours(config.token_ttl_hours),
            db.clone(),
        );
        let coordinator = Coordinator::new(db.clone(), &config.chat);
        Ok(Self {
            db,
            config,
            identity,
            coordinator,
            file_dir,
        })
    }

    /// Register a user and mint a bearer token for it.
    pub async fn add_user(&self, username: &str, display_name: &str) -> Result<(UserView, String)> {
        let user = self.coordinator.add_user(username, display_name).await?;
        let token = self.identity.issue(&user.id)?;
        info!(user_id = %user.id, username = %user.username, "user added");
        Ok((user, token))
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let files = Router::new()
        .route("/api/files", post(upload_file))
        .route("/api/files/:id", get(download_file))
        .layer(axum::extract::DefaultBodyLimit::max(
            state.config.max_upload_bytes() as usize,
        ));
    let protected = Router::new()
        .route("/api/me", get(me).patch(update_me))
        .route("/api/users", get(search_users))
        .route("/api/users/:id", get(get_user))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/chats/:id/leave", post(leave_chat))
        .route("/api/chats/:id/favorite", post(toggle_favorite))
        .route("/api/chats/:id/messages", get(get_messages).post(send_message))
        .route("/api/chats/:id/typing", post(typing))
        .route("/api/chats/:id/stream", get(push_stream))
        .route("/api/messages/:id/delivered", post(mark_delivered))
        .route("/api/messages/:id/read", post(mark_read))
        .route("/ws", get(ws_handler))
        .merge(files)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response> {
    let token = auth::bearer_token(req.headers(), req.uri().query())
        .ok_or(ChatError::Unauthenticated)?;
    let user = state.identity.verify(&token).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Path ids that are not UUIDs cannot name anything.
fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ChatError::NotFound)
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|_| ChatError::InvalidInput("invalid_body"))
}

async fn me(State(state): State<AppState>, Extension(me): Extension<UserView>) -> Result<Json<Profile>> {
    Ok(Json(state.coordinator.get_profile(&me.id).await?))
}

async fn update_me(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    payload: std::result::Result<Json<ProfileUpdate>, JsonRejection>,
) -> Result<Json<UserView>> {
    let update = body(payload)?;
    Ok(Json(state.coordinator.update_profile(&me.id, update).await?))
}

#[derive(Deserialize)]
struct SearchQuery {
    search: Option<String>,
}

async fn search_users(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<UserView>>> {
    Ok(Json(state.coordinator.search_users(&me.id, q.search).await?))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<UserView>> {
    Ok(Json(state.coordinator.get_user(parse_id(&id)?).await?))
}

async fn list_chats(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
) -> Result<Json<Vec<ChatView>>> {
    Ok(Json(state.coordinator.list_chats(&me.id).await?))
}

async fn create_chat(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    payload: std::result::Result<Json<CreateChat>, JsonRejection>,
) -> Result<Json<ChatView>> {
    let req = body(payload)?;
    Ok(Json(state.coordinator.create_chat(&me.id, req).await?))
}

async fn leave_chat(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.coordinator.leave_chat(&me.id, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_favorite(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
) -> Result<Json<Profile>> {
    Ok(Json(
        state.coordinator.toggle_favorite(&me.id, parse_id(&id)?).await?,
    ))
}

#[derive(Deserialize)]
struct Page {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn get_messages(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<MessageView>>> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let msgs = state
        .coordinator
        .get_messages(&me.id, parse_id(&id)?, limit, page.offset.unwrap_or(0))
        .await?;
    Ok(Json(msgs))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<NewMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageView>)> {
    let chat_id = parse_id(&id)?;
    let input = body(payload)?;
    let msg = state.coordinator.send_message(&me.id, chat_id, input).await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingReq {
    is_typing: bool,
}

async fn typing(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<TypingReq>, JsonRejection>,
) -> Result<StatusCode> {
    let req = body(payload)?;
    state
        .coordinator
        .typing(&me.id, parse_id(&id)?, req.is_typing)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_delivered(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
) -> Result<Json<MessageView>> {
    Ok(Json(
        state.coordinator.mark_delivered(&me.id, parse_id(&id)?).await?,
    ))
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
) -> Result<Json<MessageView>> {
    Ok(Json(
        state.coordinator.mark_read(&me.id, parse_id(&id)?).await?,
    ))
}

async fn upload_file(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ChatError::InvalidInput("invalid_upload"))?
    {
        if field.file_name().is_none() && field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("file").to_string();
        let declared = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|_| ChatError::InvalidInput("invalid_upload"))?;
        let uploaded = files::save_file(&state.file_dir, &name, declared.as_deref(), data).await?;
        info!(url = %uploaded.url, kind = uploaded.kind.as_str(), "file stored");
        return Ok((StatusCode::CREATED, Json(uploaded)).into_response());
    }
    Err(ChatError::InvalidInput("invalid_upload"))
}

async fn download_file(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let meta = files::load_meta(&state.file_dir, &id).await?;
    let file = tokio::fs::File::open(files::file_path(&state.file_dir, &id))
        .await
        .map_err(|_| ChatError::NotFound)?;
    let body = StreamBody::new(ReaderStream::new(file));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("inline; filename=\"{}\"", meta.original_name))
            .unwrap_or_else(|_| HeaderValue::from_static("inline")),
    );
    Ok((headers, body).into_response())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_socket(socket, state, me))
}

async fn push_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(me): Extension<UserView>,
    Path(id): Path<String>,
) -> Result<Response> {
    let rx = state
        .coordinator
        .subscribe_chat(&me.id, parse_id(&id)?)
        .await?;
    Ok(ws.on_upgrade(move |socket| ws::handle_stream(socket, rx)))
}

/// Run the HTTP server with the resolved configuration.
pub async fn run_http_server(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
