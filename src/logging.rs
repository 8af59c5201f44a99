use chrono::Local;
use std::io;
use std::path::Path;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "soulecho=info";

/// Routes tracing output to a timestamped file; the terminal belongs to the UI.
/// The filter comes from `RUST_LOG`.
pub fn init(log_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_name = format!("{}.log", Local::now().format("%Y%m%d_%H%M%S"));
    let file_appender = rolling::never(log_dir, &file_name);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true),
        )
        .with(filter);

    // A subscriber installed earlier (tests, embedding) wins.
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!(path = %log_dir.join(&file_name).display(), "logging initialized");
    }

    Ok(())
}
