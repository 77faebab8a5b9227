//! Anonymous two-party chat roulette.
//!
//! Connections arrive at a [`matcher::Matcher`], which parks the first one and
//! pairs it with the next arrival. A connection left waiting past the deadline
//! is paired with a [`bot::Bot`] instead, whose replies come from a Markov
//! [`chain::TextModel`] that learns from human-to-human sessions as they are
//! relayed.

pub mod bot;
pub mod chain;
pub mod cli;
pub mod config;
pub mod conn;
pub mod error;
pub mod matcher;
pub mod relay;
pub mod server;
pub mod web;
pub mod ws;

pub use bot::{Bot, BotConfig};
pub use chain::{ModelStats, TextModel, Trainer};
pub use config::{Config, Transport};
pub use conn::{Connection, StreamConn};
pub use error::{Result, RouletteError};
pub use matcher::{MatchOutcome, MatchSettings, Matcher};
pub use relay::relay;
