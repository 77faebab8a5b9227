//! Crate-level error type.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RouletteError>;

#[derive(Debug, Error)]
pub enum RouletteError {
    /// A read, write or close on a connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A Markov chain needs at least one token of context.
    #[error("invalid prefix length {0}: must be at least 1")]
    InvalidPrefixLen(usize),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("could not parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Malformed HTTP request on the web transport.
    #[error("bad http request: {0}")]
    Http(String),
}

impl RouletteError {
    pub fn config(message: impl Into<String>) -> Self {
        RouletteError::Config {
            message: message.into(),
        }
    }
}
