//! Application-facing listeners with grace-bounded handoff.
//!
//! # Responsibilities
//! - Queue inbound connections for `accept` in arrival order
//! - Bound how long a queued connection waits for its consumer
//! - Close exactly once, waking any blocked `accept`
//!
//! # Design Decisions
//! - At most [`HANDOFF_BACKLOG`] connections wait at once; further offers
//!   wait for room within the same grace period
//! - An offer that expires or is abandoned removes itself from the queue,
//!   so an idle listener holds nothing once its producers give up
//! - Whoever removes an offer from the queue under the lock owns its
//!   connection: the consumer by taking it, the producer by withdrawing it
//! - Close cancels a token and drains the queue, so an in-flight push
//!   observes closure instead of failing mid-send

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::net::conn::Conn;
use crate::net::registry::{ListenKey, ListenerRegistry, Network, RegistryError};

/// Connections that may wait for `accept` on one listener at a time.
pub const HANDOFF_BACKLOG: usize = 64;

/// Error type for listener operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("embednet: listener closed")]
    Closed,
}

/// How a single handoff attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The application accepted the connection.
    Accepted,
    /// Nobody accepted within the grace period; the connection was dropped.
    Expired,
    /// The listener closed first; the connection was dropped.
    Closed,
}

/// One queued connection waiting for `accept`.
struct Offer {
    id: u64,
    conn: Conn,
    claimed: oneshot::Sender<()>,
}

#[derive(Default)]
struct Queue {
    offers: VecDeque<Offer>,
    next_id: u64,
}

/// Withdraws a queued offer when its producer stops waiting for any reason.
struct Pending<'a> {
    entry: &'a ListenerEntry,
    id: u64,
}

impl Pending<'_> {
    /// Take the offer back. `None` means the consumer got it first.
    fn withdraw(&self) -> Option<Conn> {
        let mut queue = self.entry.queue();
        let pos = queue.offers.iter().position(|offer| offer.id == self.id)?;
        queue.offers.remove(pos).map(|offer| offer.conn)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        drop(self.withdraw());
    }
}

/// Registry-side half of a listener: the key and the handoff queue.
pub struct ListenerEntry {
    key: ListenKey,
    addr: String,
    queue: Mutex<Queue>,
    ready: Notify,
    room: Semaphore,
    closed: CancellationToken,
}

impl ListenerEntry {
    pub fn new(key: ListenKey, addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key,
            addr: addr.into(),
            queue: Mutex::new(Queue::default()),
            ready: Notify::new(),
            room: Semaphore::new(HANDOFF_BACKLOG),
            closed: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(key: ListenKey) -> Arc<Self> {
        Self::new(key, key.to_string())
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &ListenKey {
        &self.key
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Connections currently waiting for `accept`.
    pub fn queued(&self) -> usize {
        self.queue().offers.len()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
        self.room.close();
        let dropped = std::mem::take(&mut self.queue().offers);
        if !dropped.is_empty() {
            tracing::debug!(key = %self.key, dropped = dropped.len(), "Dropped queued connections on close");
        }
    }

    /// Queue `conn` and wait up to `grace` for the application to take it.
    /// A connection that is not taken is dropped, closing it.
    pub async fn offer(&self, conn: Conn, grace: Duration) -> Handoff {
        if self.is_closed() {
            return Handoff::Closed;
        }
        let deadline = Instant::now() + grace;

        let _permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Handoff::Closed,
            permit = tokio::time::timeout_at(deadline, self.room.acquire()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Handoff::Closed,
                Err(_) => return Handoff::Expired,
            },
        };

        let (claimed_tx, mut claimed_rx) = oneshot::channel();
        let pending = {
            let mut queue = self.queue();
            if self.is_closed() {
                return Handoff::Closed;
            }
            let id = queue.next_id;
            queue.next_id += 1;
            queue.offers.push_back(Offer {
                id,
                conn,
                claimed: claimed_tx,
            });
            Pending { entry: self, id }
        };
        self.ready.notify_one();

        let outcome = tokio::select! {
            biased;
            claimed = &mut claimed_rx => match claimed {
                Ok(()) => return Handoff::Accepted,
                Err(_) => Handoff::Closed,
            },
            _ = self.closed.cancelled() => Handoff::Closed,
            _ = tokio::time::sleep_until(deadline) => Handoff::Expired,
        };

        if pending.withdraw().is_some() {
            return outcome;
        }
        // Gone from the queue: claimed while we were giving up, or drained by close.
        match claimed_rx.try_recv() {
            Ok(()) => Handoff::Accepted,
            Err(_) => Handoff::Closed,
        }
    }

    async fn next(&self) -> Result<Conn, ListenerError> {
        loop {
            let ready = self.ready.notified();
            if self.is_closed() {
                return Err(ListenerError::Closed);
            }
            {
                let mut queue = self.queue();
                if let Some(offer) = queue.offers.pop_front() {
                    // Signalled under the lock so a withdrawing producer sees it.
                    let _ = offer.claimed.send(());
                    return Ok(offer.conn);
                }
            }
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(ListenerError::Closed),
                _ = ready => {}
            }
        }
    }
}

/// A listener on the overlay network, returned by `Node::listen`.
///
/// Dropping the listener closes it.
pub struct Listener {
    entry: Arc<ListenerEntry>,
    registry: Arc<ListenerRegistry>,
    closing: AtomicBool,
}

impl Listener {
    pub(crate) fn open(
        registry: &Arc<ListenerRegistry>,
        key: ListenKey,
        addr: &str,
    ) -> Result<Self, RegistryError> {
        let entry = ListenerEntry::new(key, addr);
        registry.register(Arc::clone(&entry))?;
        Ok(Self {
            entry,
            registry: Arc::clone(registry),
            closing: AtomicBool::new(false),
        })
    }

    /// Wait for the next connection. Fails once the listener is closed.
    pub async fn accept(&self) -> Result<Conn, ListenerError> {
        self.entry.next().await
    }

    /// Close the listener. Only the first call has any effect.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.registry.unregister(&self.entry) {
            // Already removed by a node-wide close.
            self.entry.close();
        }
    }

    /// The address string this listener was opened with.
    pub fn addr(&self) -> &str {
        self.entry.addr()
    }

    pub fn key(&self) -> &ListenKey {
        self.entry.key()
    }

    pub fn network(&self) -> Network {
        self.entry.key().network
    }

    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("key", self.key())
            .field("addr", &self.addr())
            .finish()
    }
}
