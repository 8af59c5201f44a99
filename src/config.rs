use crate::client::ClientConfig;
use crate::session::{SessionConfig, DEFAULT_PAGE_SIZE};
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";

#[derive(Debug, Parser)]
#[command(name = "soulecho", version, about = "Chat with your SoulEcho companions from the terminal")]
pub struct Cli {
    /// Base URL of the backend API.
    #[arg(long, env = "SOULECHO_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Bearer token; falls back to ~/.soulecho/token.
    #[arg(long, env = "SOULECHO_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Character to talk to.
    #[arg(long, short = 'c', env = "SOULECHO_CHARACTER")]
    pub character: String,

    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Minimum spacing between screen refreshes while a reply streams in.
    #[arg(long, default_value_t = 50)]
    pub render_interval_ms: u64,

    #[arg(long, env = "SOULECHO_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the interactive chat (default).
    Chat,
    /// Send one message and print the reply.
    Send {
        message: String,
        /// Use the non-streaming endpoint.
        #[arg(long)]
        no_stream: bool,
    },
    /// Print recent history.
    History {
        /// How many pages to fetch, newest first.
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Search the stored history.
    Search { query: String },
    /// Export the full history as JSON.
    Export {
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Delete all stored history for the character.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Show conversation statistics.
    Stats,
}

#[derive(Debug)]
pub struct Config {
    pub base_url: String,
    pub token: Option<String>,
    pub session: SessionConfig,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> io::Result<Self> {
        let token = resolve_token(cli.token.clone())?;
        let mut session = SessionConfig::new(cli.character.clone());
        session.page_size = cli.page_size.max(1);
        session.render_interval = Duration::from_millis(cli.render_interval_ms);

        Ok(Self {
            base_url: cli.base_url.clone(),
            token,
            session,
            log_dir: cli.log_dir.clone().unwrap_or_else(default_log_dir),
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
        }
    }
}

pub fn resolve_token(explicit: Option<String>) -> io::Result<Option<String>> {
    if let Some(token) = explicit.filter(|t| !t.trim().is_empty()) {
        return Ok(Some(token));
    }

    read_token_file(&token_path())
}

fn read_token_file(path: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(token) => {
            let token = token.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn token_path() -> PathBuf {
    app_dir().join("token")
}

fn default_log_dir() -> PathBuf {
    app_dir().join("logs")
}

fn app_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".soulecho"),
        None => PathBuf::from(".soulecho"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_interactive_chat() {
        let cli = Cli::try_parse_from(["soulecho", "--character", "abc", "--token", "t"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.page_size, DEFAULT_PAGE_SIZE);

        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.session.character_id, "abc");
        assert_eq!(config.session.render_interval, Duration::from_millis(50));
        assert_eq!(config.token.as_deref(), Some("t"));
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from([
            "soulecho",
            "-c",
            "abc",
            "send",
            "hello there",
            "--no-stream",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Send { message, no_stream }) => {
                assert_eq!(message, "hello there");
                assert!(no_stream);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn app_files_live_under_home() {
        let home = dirs::home_dir().unwrap_or_default();
        assert_eq!(app_dir(), home.join(".soulecho"));
        assert_eq!(token_path(), home.join(".soulecho").join("token"));
        assert_eq!(default_log_dir(), home.join(".soulecho").join("logs"));
    }

    #[test]
    fn token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  abc123\n").unwrap();

        assert_eq!(read_token_file(&path).unwrap().as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_or_blank_token_file_means_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        assert_eq!(read_token_file(&path).unwrap(), None);

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(read_token_file(&path).unwrap(), None);
    }
}
