//! Pairs arriving connections two at a time, falling back to a bot.
//!
//! ## Design
//! - One waiting slot behind a `std::sync::Mutex`. A caller either takes the
//!   parked waiter (claim) or parks itself (offer) in a single critical
//!   section, so there is no check-then-set window and each offer reaches at
//!   most one claimant.
//! - A parked caller races its hand-off against its own deadline and against
//!   its connection going away. It keeps reading while parked; input sent
//!   before pairing is dropped, and EOF or a read error withdraws the offer.
//! - A claim is a two-step hand-off. The claimant sends a [`Pairing`] and only
//!   starts the session once the parked caller confirms it stopped reading.
//!   A waiter that left in between never confirms, and the claimant goes back
//!   to the slot.
//! - The claimant drives the relay, then signals the parked caller that the
//!   session is over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bot::{Bot, BotConfig};
use crate::chain::TextModel;
use crate::conn::Connection;
use crate::error::Result;
use crate::relay::relay;

/// Sent to every connection on arrival.
pub const WAITING_NOTICE: &[u8] = b"Waiting for a chat partner...";

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const DRAIN_BUF_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSettings {
    /// How long a parked connection waits for a human before getting a bot.
    pub wait_timeout: Duration,
    pub bot: BotConfig,
    /// Tap human-to-human sessions into the model.
    pub train_on_human: bool,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            bot: BotConfig::default(),
            train_on_human: true,
        }
    }
}

/// Which branch a [`Matcher::run`] call took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Parked and taken by a later arrival, which drove the session.
    Offered,
    /// Took a parked connection and drove the session.
    Claimed,
    /// Nobody came in time; chatted with a bot.
    Bot,
    /// The connection went away while parked.
    Abandoned,
}

impl std::fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchOutcome::Offered => write!(f, "offered"),
            MatchOutcome::Claimed => write!(f, "claimed"),
            MatchOutcome::Bot => write!(f, "bot"),
            MatchOutcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// What a claimant hands to the parked caller it took.
struct Pairing {
    /// Confirmed once the parked caller has stopped reading its connection.
    ready: oneshot::Sender<()>,
    /// Resolves when the claimant's session has ended.
    done: oneshot::Receiver<()>,
}

struct Waiter {
    ticket: u64,
    conn: Arc<dyn Connection>,
    handoff: oneshot::Sender<Pairing>,
}

/// A waiter that confirmed the hand-off.
struct Partner {
    ticket: u64,
    conn: Arc<dyn Connection>,
    done: oneshot::Sender<()>,
}

enum Entry {
    Claimed(Waiter),
    Parked(oneshot::Receiver<Pairing>),
}

enum Wake {
    Handed(std::result::Result<Pairing, oneshot::error::RecvError>),
    Deadline,
    Gone,
}

/// Withdraws a parked offer if the parked call is dropped before resolving.
struct OfferGuard<'a> {
    matcher: &'a Matcher,
    ticket: u64,
    armed: bool,
}

impl OfferGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.matcher.withdraw(self.ticket);
        }
    }
}

pub struct Matcher {
    model: Arc<TextModel>,
    settings: MatchSettings,
    slot: Mutex<Option<Waiter>>,
    next_ticket: AtomicU64,
}

impl Matcher {
    pub fn new(model: Arc<TextModel>, settings: MatchSettings) -> Self {
        Self {
            model,
            settings,
            slot: Mutex::new(None),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    pub fn model(&self) -> &Arc<TextModel> {
        &self.model
    }

    /// True while some connection is parked.
    pub fn has_waiter(&self) -> bool {
        self.slot().is_some()
    }

    // The slot is only ever swapped whole, so a poisoned lock is still consistent.
    fn slot(&self) -> MutexGuard<'_, Option<Waiter>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer_or_claim(&self, ticket: u64, conn: &Arc<dyn Connection>) -> Entry {
        let mut slot = self.slot();
        if let Some(waiter) = slot.take() {
            return Entry::Claimed(waiter);
        }
        let (handoff, parked) = oneshot::channel();
        *slot = Some(Waiter {
            ticket,
            conn: Arc::clone(conn),
            handoff,
        });
        Entry::Parked(parked)
    }

    /// Remove our offer if it is still parked. False means it was claimed.
    fn withdraw(&self, ticket: u64) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|w| w.ticket == ticket) {
            *slot = None;
            return true;
        }
        false
    }

    /// Match `conn` with a partner and run its session to completion.
    pub async fn run(&self, conn: Arc<dyn Connection>) -> Result<MatchOutcome> {
        if let Err(e) = conn.write(WAITING_NOTICE).await {
            let _ = conn.close().await;
            return Err(e.into());
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut parked = loop {
            match self.offer_or_claim(ticket, &conn) {
                Entry::Claimed(waiter) => {
                    let Some(partner) = self.confirm(waiter).await else {
                        continue;
                    };
                    debug!(ticket, partner = partner.ticket, "claimed waiting partner");
                    self.chat_with(partner, conn).await;
                    return Ok(MatchOutcome::Claimed);
                }
                Entry::Parked(parked) => break parked,
            }
        };
        debug!(ticket, "waiting for partner");

        let mut guard = OfferGuard {
            matcher: self,
            ticket,
            armed: true,
        };
        let deadline = tokio::time::sleep(self.settings.wait_timeout);
        tokio::pin!(deadline);
        let mut scratch = vec![0u8; DRAIN_BUF_LEN];
        let wake = loop {
            tokio::select! {
                handed = &mut parked => break Wake::Handed(handed),
                () = &mut deadline => break Wake::Deadline,
                read = conn.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => break Wake::Gone,
                    Ok(n) => debug!(ticket, bytes = n, "dropping input sent before pairing"),
                },
            }
        };

        let handed = match wake {
            Wake::Handed(handed) => handed,
            Wake::Deadline if self.withdraw(ticket) => {
                guard.disarm();
                info!(ticket, "no partner in time, pairing with bot");
                self.chat_with_bot(conn).await;
                return Ok(MatchOutcome::Bot);
            }
            Wake::Gone if self.withdraw(ticket) => {
                guard.disarm();
                debug!(ticket, "left before a partner arrived");
                let _ = conn.close().await;
                return Ok(MatchOutcome::Abandoned);
            }
            Wake::Gone => {
                // claimed already; dropping the pairing unconfirmed sends the
                // claimant back to the slot
                guard.disarm();
                drop(parked.await);
                debug!(ticket, "left while being claimed");
                let _ = conn.close().await;
                return Ok(MatchOutcome::Abandoned);
            }
            // claimed between the deadline and the withdrawal
            Wake::Deadline => parked.await,
        };
        guard.disarm();

        match handed {
            Ok(pairing) => {
                if pairing.ready.send(()).is_err() {
                    debug!(ticket, "claimant left before confirming");
                }
                let _ = pairing.done.await;
            }
            Err(_) => warn!(ticket, "offer dropped without a session"),
        }
        Ok(MatchOutcome::Offered)
    }

    /// Hand a pairing to a claimed waiter and wait for it to confirm.
    async fn confirm(&self, waiter: Waiter) -> Option<Partner> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let pairing = Pairing {
            ready: ready_tx,
            done: done_rx,
        };
        if waiter.handoff.send(pairing).is_ok() && ready_rx.await.is_ok() {
            return Some(Partner {
                ticket: waiter.ticket,
                conn: waiter.conn,
                done: done_tx,
            });
        }
        debug!(partner = waiter.ticket, "waiting partner left before pairing");
        let _ = waiter.conn.close().await;
        None
    }

    async fn chat_with(&self, partner: Partner, conn: Arc<dyn Connection>) {
        let tap = self
            .settings
            .train_on_human
            .then(|| self.model.trainer());
        if let Err(e) = relay(partner.conn, conn, tap).await {
            debug!(error = %e, "human session ended with error");
        }
        let _ = partner.done.send(());
    }

    async fn chat_with_bot(&self, conn: Arc<dyn Connection>) {
        let bot: Arc<dyn Connection> = Arc::new(Bot::new(Arc::clone(&self.model), self.settings.bot));
        if let Err(e) = relay(bot, conn, None).await {
            debug!(error = %e, "bot session ended with error");
        }
    }
}
