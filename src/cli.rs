use crate::config::{Config, Transport};
use crate::error::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sock-roulette")]
#[command(version)]
#[command(about = "Anonymous chat roulette with a Markov-chain bot for the lonely")]
pub struct Args {
    /// TOML config file; flags given here override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g. localhost:4000)
    #[arg(long)]
    pub listen: Option<String>,

    /// Transport clients connect with
    #[arg(long, value_enum)]
    pub transport: Option<Transport>,

    /// Milliseconds to wait for a human partner before pairing with the bot
    #[arg(long)]
    pub wait_timeout_ms: Option<u64>,

    /// Milliseconds the bot waits before each reply
    #[arg(long)]
    pub reply_delay_ms: Option<u64>,

    /// Maximum tokens per bot reply
    #[arg(long)]
    pub reply_tokens: Option<usize>,

    /// Markov chain prefix length
    #[arg(long)]
    pub prefix_len: Option<usize>,

    /// Text file to train the model on at startup
    #[arg(long)]
    pub seed_corpus: Option<PathBuf>,

    /// Do not learn from human-to-human sessions
    #[arg(long)]
    pub no_train: bool,
}

impl Args {
    /// Apply the flags that were given on top of `base`.
    pub fn apply(&self, mut base: Config) -> Config {
        if let Some(listen) = &self.listen {
            base.listen_addr = listen.clone();
        }
        if let Some(transport) = self.transport {
            base.transport = transport;
        }
        if let Some(ms) = self.wait_timeout_ms {
            base.wait_timeout_ms = ms;
        }
        if let Some(ms) = self.reply_delay_ms {
            base.reply_delay_ms = ms;
        }
        if let Some(n) = self.reply_tokens {
            base.reply_tokens = n;
        }
        if let Some(k) = self.prefix_len {
            base.prefix_len = k;
        }
        if let Some(path) = &self.seed_corpus {
            base.seed_corpus = Some(path.clone());
        }
        if self.no_train {
            base.train_on_human = false;
        }
        base
    }

    /// Load the config file (if any), apply flags and validate the result.
    pub fn resolve(&self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let config = self.apply(base);
        config.validate()?;
        Ok(config)
    }
}
