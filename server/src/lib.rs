pub mod api;
pub mod auth;
pub mod chats;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod files;
pub mod messages;
pub mod presence;
pub mod push;
pub mod registry;
pub mod status;
pub mod typing;
pub mod users;
pub mod ws;

pub use api::{build_router, run_http_server, AppState};
pub use config::{Cli, Command, Config};
pub use error::{ChatError, Result};
