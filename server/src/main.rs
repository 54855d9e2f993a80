use anyhow::Result;
use clap::Parser;
use mingle_server::{api, AppState, Cli, Command, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;
    let level = if cfg.logging_enabled { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => api::run_http_server(cfg).await,
        Command::AddUser {
            username,
            display_name,
        } => {
            let state = AppState::new(cfg).await?;
            let display_name = display_name.unwrap_or_default();
            let (user, token) = state.add_user(&username, &display_name).await?;
            println!("{} {}", user.id, token);
            Ok(())
        }
    }
}
