mod client;
mod commands;
mod config;
mod error;
mod frame;
mod logging;
mod protocol;
mod session;
mod state;
mod throttle;
mod ui;

#[cfg(test)]
mod test_support;

use clap::Parser;
use client::ChatClient;
use config::{Cli, Command, Config};
use session::ChatSession;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;
    logging::init(&config.log_dir)?;

    let client = ChatClient::new(config.client_config());
    tracing::info!(
        base_url = %client.base_url(),
        character_id = %config.session.character_id,
        authenticated = config.token.is_some(),
        "starting soulecho"
    );
    let session = ChatSession::new(client, config.session.clone());

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => ui::run_tui(session),
        Command::Send { message, no_stream } => {
            commands::send(&session, &message, !no_stream).await
        }
        Command::History { pages } => commands::history(&session, pages.max(1)).await,
        Command::Search { query } => commands::search(&session, &query).await,
        Command::Export { output } => commands::export(&session, output).await,
        Command::Clear { yes } => commands::clear(&session, yes).await,
        Command::Stats => commands::stats(&session).await,
    }
}
