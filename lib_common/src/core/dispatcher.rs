//! # Subscriber Registry and Fan-out
//!
//! Tracks every downstream subscriber and pushes the same serialized payload to
//! all of them on each broadcast tick.
//!
//! ## Design
//!
//! 1.  **Zero-copy fan-out**: the payload is an `Arc<str>`; each subscriber gets
//!     a pointer to the same bytes.
//! 2.  **Never block the tick**: each subscriber owns a one-slot channel and the
//!     registry only ever calls `try_send`. A subscriber whose socket is slow
//!     keeps its queued frame and simply misses this tick; everybody else is
//!     served regardless. There is no per-subscriber backlog and no replay.
//! 3.  **Liveness**: a subscriber is `Open` until its connection task reports
//!     `Closing`, and `Closed` once its [`SubscriberLink`] is dropped. Only `Open`
//!     subscribers are sent to; closed ones are pruned on the next broadcast.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

/// A serialized broadcast frame shared by every subscriber.
pub type Payload = Arc<str>;

/// Connection state of one subscriber as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Eligible for broadcasts.
    Open,
    /// The peer started a close handshake; no more sends are attempted.
    Closing,
    /// The connection task is gone.
    Closed,
}

impl Liveness {
    fn as_u8(self) -> u8 {
        match self {
            Liveness::Open => 0,
            Liveness::Closing => 1,
            Liveness::Closed => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Liveness::Open,
            1 => Liveness::Closing,
            _ => Liveness::Closed,
        }
    }
}

/// Registry-side record of one subscriber.
struct SubscriberHandle {
    id: u64,
    peer: String,
    sender: mpsc::Sender<Payload>,
    liveness: Arc<AtomicU8>,
}

impl SubscriberHandle {
    fn liveness(&self) -> Liveness {
        if self.sender.is_closed() {
            return Liveness::Closed;
        }
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }
}

/// Connection-side half handed to the task that owns the subscriber's socket.
pub struct SubscriberLink {
    /// Registry-assigned identifier.
    pub id: u64,
    receiver: mpsc::Receiver<Payload>,
    liveness: Arc<AtomicU8>,
}

impl SubscriberLink {
    /// Waits for the next broadcast frame. `None` once the registry dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    /// Stops further broadcasts to this subscriber.
    pub fn mark_closing(&self) {
        self.liveness.store(Liveness::Closing.as_u8(), Ordering::Release);
    }

    /// Current liveness of this subscriber.
    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }
}

impl Drop for SubscriberLink {
    fn drop(&mut self) {
        self.liveness.store(Liveness::Closed.as_u8(), Ordering::Release);
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Open subscribers a send was attempted to.
    pub attempted: usize,
    /// Sends that were queued.
    pub delivered: usize,
    /// Subscribers that still had the previous frame pending.
    pub lagging: usize,
    /// Subscribers found gone during this fan-out and pruned.
    pub dropped: usize,
}

/// The registry of downstream subscribers.
#[derive(Default)]
pub struct Dispatcher {
    clients: Mutex<Vec<SubscriberHandle>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection. It receives the next broadcast onward.
    pub fn register(&self, peer: &str) -> SubscriberLink {
        let (tx, rx) = mpsc::channel(1);
        let liveness = Arc::new(AtomicU8::new(Liveness::Open.as_u8()));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.push(SubscriberHandle {
            id,
            peer: peer.to_string(),
            sender: tx,
            liveness: Arc::clone(&liveness),
        });
        log::info!("Subscriber {} ({}) registered, {} total", id, peer, clients.len());

        SubscriberLink { id, receiver: rx, liveness }
    }

    /// Removes a subscriber explicitly, e.g. when its socket task ends.
    pub fn remove(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|c| c.id != id);
        log::info!("Subscriber {} removed, {} remaining", id, clients.len());
    }

    /// Number of subscribers currently eligible for broadcasts.
    pub fn open_count(&self) -> usize {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.iter().filter(|c| c.liveness() == Liveness::Open).count()
    }

    /// Sends `payload` to every open subscriber without waiting on any of them.
    pub fn broadcast(&self, payload: &Payload) -> FanoutReport {
        let mut report = FanoutReport::default();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        clients.retain(|client| match client.liveness() {
            Liveness::Open => {
                report.attempted += 1;
                match client.sender.try_send(Arc::clone(payload)) {
                    Ok(()) => {
                        report.delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        log::trace!("Subscriber {} ({}) still busy, skipping tick", client.id, client.peer);
                        report.lagging += 1;
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::info!("Subscriber {} ({}) disconnected. Removing from registry.", client.id, client.peer);
                        report.dropped += 1;
                        false
                    }
                }
            }
            Liveness::Closing => true,
            Liveness::Closed => {
                report.dropped += 1;
                false
            }
        });

        report
    }
}
