//! Markov chain text model: online training and bounded generation.
//!
//! ## Design
//! - The table maps a prefix key (the last `k` tokens joined by a single
//!   space) to every suffix ever observed after it. Repeated suffixes are kept,
//!   so a uniform pick over the list is a frequency-weighted pick.
//! - One `std::sync::Mutex` guards both appends and lookups.
//! - Each training stream owns a [`Trainer`] cursor holding its rolling prefix,
//!   so chunk boundaries within a stream do not reset context.
//! - Generation always restarts from `k` empty tokens and never touches any
//!   trainer's cursor.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, RouletteError};

/// Prefix length used when none is configured.
pub const DEFAULT_PREFIX_LEN: usize = 2;

/// Prefix key → observed suffixes in insertion order.
pub type ChainTable = HashMap<String, Vec<String>>;

/// Split a chunk into tokens on single spaces.
///
/// No trimming or normalisation: consecutive spaces yield empty tokens and
/// newlines stay attached to their word.
pub fn tokenize(chunk: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(chunk)
        .split(' ')
        .map(str::to_string)
        .collect()
}

/// A rolling window of the last `k` tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    tokens: VecDeque<String>,
}

impl Prefix {
    /// `len` empty tokens, the start state of every stream and every generation.
    pub fn empty(len: usize) -> Self {
        Self {
            tokens: std::iter::repeat(String::new()).take(len).collect(),
        }
    }

    /// Drop the oldest token and append `token`.
    pub fn shift(&mut self, token: &str) {
        self.tokens.pop_front();
        self.tokens.push_back(token.to_string());
    }

    /// The table key for this prefix.
    pub fn key(&self) -> String {
        let parts: Vec<&str> = self.tokens.iter().map(String::as_str).collect();
        parts.join(" ")
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Size summary of a model's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    pub prefix_len: usize,
    /// Distinct prefixes with at least one suffix.
    pub prefixes: usize,
    /// Total suffix observations, duplicates included.
    pub suffixes: usize,
}

/// Shared, append-only Markov chain.
#[derive(Debug)]
pub struct TextModel {
    prefix_len: usize,
    table: Mutex<ChainTable>,
}

impl TextModel {
    pub fn new(prefix_len: usize) -> Result<Self> {
        if prefix_len == 0 {
            return Err(RouletteError::InvalidPrefixLen(prefix_len));
        }
        Ok(Self {
            prefix_len,
            table: Mutex::new(HashMap::new()),
        })
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    // Appends never leave the table half-updated, so a poisoned lock is still usable.
    fn table(&self) -> MutexGuard<'_, ChainTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new training stream with its own rolling prefix.
    pub fn trainer(self: &Arc<Self>) -> Trainer {
        Trainer {
            model: Arc::clone(self),
            cursor: Prefix::empty(self.prefix_len),
        }
    }

    /// Train on a single standalone chunk, starting from the empty prefix.
    pub fn train(&self, chunk: &[u8]) {
        let mut cursor = Prefix::empty(self.prefix_len);
        self.feed(&mut cursor, chunk);
    }

    fn feed(&self, cursor: &mut Prefix, chunk: &[u8]) {
        let tokens = tokenize(chunk);
        let mut table = self.table();
        for token in tokens {
            table.entry(cursor.key()).or_default().push(token.clone());
            cursor.shift(&token);
        }
    }

    /// Suffixes recorded for `key`, cloned out of the table.
    pub fn suffixes(&self, key: &str) -> Vec<String> {
        self.table().get(key).cloned().unwrap_or_default()
    }

    /// Generate up to `max_tokens` tokens using the thread-local RNG.
    pub fn generate(&self, max_tokens: usize) -> String {
        self.generate_with(&mut rand::thread_rng(), max_tokens)
    }

    /// Generate up to `max_tokens` tokens, drawing choices from `rng`.
    ///
    /// Stops early at the first prefix with no recorded suffix. Each lookup
    /// takes the lock separately, so concurrent training may extend the chain
    /// mid-generation but never corrupts it.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R, max_tokens: usize) -> String {
        let mut prefix = Prefix::empty(self.prefix_len);
        let mut words: Vec<String> = Vec::new();
        for _ in 0..max_tokens {
            let next = {
                let table = self.table();
                table
                    .get(&prefix.key())
                    .and_then(|choices| choices.choose(rng))
                    .cloned()
            };
            let Some(word) = next else { break };
            prefix.shift(&word);
            words.push(word);
        }
        words.join(" ")
    }

    pub fn stats(&self) -> ModelStats {
        let table = self.table();
        ModelStats {
            prefix_len: self.prefix_len,
            prefixes: table.len(),
            suffixes: table.values().map(Vec::len).sum(),
        }
    }
}

/// One logical training stream over a shared [`TextModel`].
#[derive(Debug)]
pub struct Trainer {
    model: Arc<TextModel>,
    cursor: Prefix,
}

impl Trainer {
    /// Train on the next chunk of this stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.model.feed(&mut self.cursor, chunk);
    }

    pub fn cursor(&self) -> &Prefix {
        &self.cursor
    }
}

impl std::io::Write for Trainer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
