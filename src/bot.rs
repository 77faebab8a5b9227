//! A synthetic chat partner backed by the shared [`TextModel`].
//!
//! Every write the bot receives is accepted at once and schedules one reply on
//! a detached task: after `reply_delay` the task generates up to
//! `reply_tokens` tokens and queues the text for the bot's `read` side. Writes
//! are not coalesced, so a burst of K messages yields K replies, each one
//! generated when its own timer fires.
//!
//! The relay's "connected" notice reaches the bot through the same write path
//! as human messages, so every bot session opens with one unprompted reply.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::chain::TextModel;
use crate::conn::{closed_error, CloseSignal, Connection};

pub const DEFAULT_REPLY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_REPLY_TOKENS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotConfig {
    pub reply_delay: Duration,
    /// Upper bound on tokens per generated reply.
    pub reply_tokens: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            reply_delay: DEFAULT_REPLY_DELAY,
            reply_tokens: DEFAULT_REPLY_TOKENS,
        }
    }
}

struct Outbox {
    rx: mpsc::UnboundedReceiver<String>,
    pending: Vec<u8>,
}

pub struct Bot {
    model: Arc<TextModel>,
    config: BotConfig,
    replies: mpsc::UnboundedSender<String>,
    outbox: Mutex<Outbox>,
    signal: Arc<CloseSignal>,
}

impl Bot {
    pub fn new(model: Arc<TextModel>, config: BotConfig) -> Self {
        let (replies, rx) = mpsc::unbounded_channel();
        Self {
            model,
            config,
            replies,
            outbox: Mutex::new(Outbox {
                rx,
                pending: Vec::new(),
            }),
            signal: Arc::new(CloseSignal::new()),
        }
    }

    pub fn config(&self) -> BotConfig {
        self.config
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    fn schedule_reply(&self) {
        let model = Arc::clone(&self.model);
        let replies = self.replies.clone();
        let signal = Arc::clone(&self.signal);
        let BotConfig {
            reply_delay,
            reply_tokens,
        } = self.config;

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(reply_delay) => {}
                () = signal.closed() => return,
            }
            let reply = model.generate(reply_tokens);
            if reply.is_empty() {
                debug!("bot has nothing to say");
                return;
            }
            if signal.is_closed() {
                return;
            }
            debug!(reply = %reply, "bot reply");
            let _ = replies.send(reply);
        });
    }
}

#[async_trait]
impl Connection for Bot {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.signal.is_closed() {
            return Err(closed_error());
        }
        tokio::select! {
            res = async {
                let mut outbox = self.outbox.lock().await;
                if outbox.pending.is_empty() {
                    match outbox.rx.recv().await {
                        Some(reply) => outbox.pending = reply.into_bytes(),
                        None => return Ok(0),
                    }
                }
                let n = buf.len().min(outbox.pending.len());
                buf[..n].copy_from_slice(&outbox.pending[..n]);
                outbox.pending.drain(..n);
                Ok::<_, io::Error>(n)
            } => res,
            () = self.signal.closed() => Err(closed_error()),
        }
    }

    /// Accepts the message and schedules one delayed reply. Never blocks.
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.signal.is_closed() {
            return Err(closed_error());
        }
        self.schedule_reply();
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.signal.fire();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> BotConfig {
        BotConfig {
            reply_delay: Duration::from_millis(30),
            reply_tokens: 10,
        }
    }

    fn model_with(text: &str) -> Arc<TextModel> {
        let model = Arc::new(TextModel::new(2).unwrap());
        model.train(text.as_bytes());
        model
    }

    async fn read_reply(bot: &Bot) -> String {
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), bot.read(&mut buf))
            .await
            .expect("no reply in time")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_connected_notice_gets_a_reply() {
        let bot = Bot::new(model_with("hello there"), fast());
        let n = bot.write(crate::relay::CONNECTED_NOTICE).await.unwrap();
        assert_eq!(n, crate::relay::CONNECTED_NOTICE.len());
        assert_eq!(read_reply(&bot).await, "hello there");
    }

    #[test]
    fn test_default_config() {
        let config = BotConfig::default();
        assert_eq!(config.reply_delay, Duration::from_secs(1));
        assert_eq!(config.reply_tokens, 10);
    }

    #[tokio::test]
    async fn test_write_succeeds_immediately() {
        let bot = Bot::new(model_with("hi there"), BotConfig::default());
        let n = tokio::time::timeout(Duration::from_millis(50), bot.write(b"hello"))
            .await
            .expect("write blocked")
            .unwrap();
        assert_eq!(n, 5);
    }

    #[tokio::test]
    async fn test_write_produces_generated_reply() {
        let bot = Bot::new(model_with("hi there"), fast());
        bot.write(b"hello").await.unwrap();
        assert_eq!(read_reply(&bot).await, "hi there");
    }

    #[tokio::test]
    async fn test_reply_waits_for_delay() {
        let config = BotConfig {
            reply_delay: Duration::from_millis(200),
            reply_tokens: 10,
        };
        let bot = Bot::new(model_with("hi there"), config);
        bot.write(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let early = tokio::time::timeout(Duration::from_millis(50), bot.read(&mut buf)).await;
        assert!(early.is_err(), "reply arrived before the delay");
    }

    #[tokio::test]
    async fn test_burst_yields_one_reply_per_write() {
        let bot = Bot::new(model_with("reply"), fast());
        for _ in 0..5 {
            bot.write(b"msg").await.unwrap();
        }
        let mut received = 0;
        let mut buf = [0u8; 256];
        while received < 5 {
            let n = tokio::time::timeout(Duration::from_secs(2), bot.read(&mut buf))
                .await
                .expect("missing reply")
                .unwrap();
            // replies may be queued back to back; each one is the word "reply"
            received += String::from_utf8_lossy(&buf[..n]).matches("reply").count();
        }
        assert_eq!(received, 5);
        let extra = tokio::time::timeout(Duration::from_millis(150), bot.read(&mut buf)).await;
        assert!(extra.is_err(), "more replies than writes");
    }

    #[tokio::test]
    async fn test_reply_respects_token_budget() {
        let config = BotConfig {
            reply_delay: Duration::from_millis(10),
            reply_tokens: 3,
        };
        let bot = Bot::new(model_with("one two three four five six"), config);
        bot.write(b"go").await.unwrap();
        assert_eq!(read_reply(&bot).await, "one two three");
    }

    #[tokio::test]
    async fn test_untrained_bot_stays_silent() {
        let bot = Bot::new(Arc::new(TextModel::new(2).unwrap()), fast());
        bot.write(b"anyone?").await.unwrap();
        let mut buf = [0u8; 64];
        let res = tokio::time::timeout(Duration::from_millis(150), bot.read(&mut buf)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_replies_and_unblocks_read() {
        let bot = Arc::new(Bot::new(model_with("hi there"), fast()));
        bot.write(b"hello").await.unwrap();
        let reader = {
            let bot = Arc::clone(&bot);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                bot.read(&mut buf).await
            })
        };
        bot.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read still blocked after close")
            .unwrap();
        assert!(res.is_err());
        assert!(bot.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bot = Bot::new(model_with("x"), fast());
        bot.close().await.unwrap();
        bot.close().await.unwrap();
        assert!(bot.is_closed());
    }
}
