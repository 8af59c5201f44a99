use thiserror::Error;

/// Failures of a single HTTP exchange with the backend.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Transport(#[source] ClientError),

    /// The server reported a failure through an `ERROR` frame.
    #[error("{0}")]
    StreamAborted(String),

    #[error("failed to read response stream: {0}")]
    StreamRead(#[source] reqwest::Error),

    #[error("stream closed before completion")]
    StreamIncomplete,

    #[error("failed to load history: {0}")]
    History(#[source] ClientError),

    #[error("search failed: {0}")]
    Search(#[source] ClientError),

    #[error("export failed: {0}")]
    Export(#[source] ClientError),

    #[error("failed to clear history: {0}")]
    Clear(#[source] ClientError),

    #[error("failed to load stats: {0}")]
    Stats(#[source] ClientError),
}
