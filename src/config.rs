//! Runtime configuration: TOML file defaults, overridden by CLI flags.

use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bot::BotConfig;
use crate::error::{Result, RouletteError};
use crate::matcher::MatchSettings;

/// How clients reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Raw TCP: telnet or netcat friendly.
    #[default]
    Tcp,
    /// HTTP page plus a WebSocket endpoint at `/ws`.
    Web,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Web => write!(f, "web"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_addr: String,
    pub transport: Transport,
    pub wait_timeout_ms: u64,
    pub reply_delay_ms: u64,
    pub reply_tokens: usize,
    pub prefix_len: usize,
    pub train_on_human: bool,
    /// Text file trained into the model at startup.
    pub seed_corpus: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:4000".to_string(),
            transport: Transport::Tcp,
            wait_timeout_ms: 5_000,
            reply_delay_ms: 1_000,
            reply_tokens: 10,
            prefix_len: crate::chain::DEFAULT_PREFIX_LEN,
            train_on_human: true,
            seed_corpus: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RouletteError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix_len == 0 {
            return Err(RouletteError::config("prefix_len must be at least 1"));
        }
        if self.wait_timeout_ms == 0 {
            return Err(RouletteError::config("wait_timeout_ms must be > 0"));
        }
        if self.reply_tokens == 0 {
            return Err(RouletteError::config("reply_tokens must be > 0"));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(RouletteError::config("listen_addr must not be empty"));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.reply_delay_ms)
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            wait_timeout: self.wait_timeout(),
            bot: BotConfig {
                reply_delay: self.reply_delay(),
                reply_tokens: self.reply_tokens,
            },
            train_on_human: self.train_on_human,
        }
    }
}
