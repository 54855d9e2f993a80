use crate::db::Db;
use crate::error::{ChatError, Result};
use crate::users;
use anyhow::Context;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chat_protocol::UserView;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Issue a JWT for a given subject valid for the provided duration.
pub fn issue_jwt(secret: &[u8], sub: &str, valid_for: Duration) -> anyhow::Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: sub.into(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> anyhow::Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        anyhow::bail!("expired");
    }
    Ok(data.claims)
}

/// Pull a bearer token from the Authorization header, falling back to a
/// `token` query parameter for WebSocket handshakes.
pub fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    })
}

/// Load the signing secret from `<dir>/jwt_secret`, creating it on first run.
pub fn load_or_create_secret(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let path = dir.join("jwt_secret");
    if let Ok(text) = std::fs::read_to_string(&path) {
        return STANDARD
            .decode(text.trim())
            .context("corrupt jwt_secret file");
    }
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, STANDARD.encode(&secret))?;
    Ok(secret)
}

/// Turns bearer tokens into user identities.
///
/// Stateless apart from the user lookup; used by request middleware and by
/// live-connection handshakes alike.
#[derive(Clone)]
pub struct Identity {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
    db: Db,
}

impl Identity {
    pub fn new(secret: Vec<u8>, ttl: Duration, db: Db) -> Self {
        Self {
            secret: Arc::new(secret),
            ttl,
            db,
        }
    }

    /// Mint a token for a user.
    pub fn issue(&self, user_id: &Uuid) -> Result<String> {
        Ok(issue_jwt(&self.secret, &user_id.to_string(), self.ttl)?)
    }

    /// Resolve a token to its user. Any failure is `Unauthenticated`.
    pub async fn verify(&self, token: &str) -> Result<UserView> {
        let claims = verify_jwt(&self.secret, token).map_err(|_| ChatError::Unauthenticated)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| ChatError::Unauthenticated)?;
        self.db
            .run(move |conn| users::get_user(conn, &user_id))
            .await?
            .ok_or(ChatError::Unauthenticated)
    }
}
