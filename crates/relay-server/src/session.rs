//! One connected viewer.
//!
//! A [`Session`] is the fan-out's view of a connection: an identity, the
//! peer address, and the sending half of a bounded outbound queue. The
//! connection handler owns the receiving half and is the only task that
//! writes to the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use relay_types::SessionId;
use tokio::sync::{Notify, mpsc};

/// Result of a non-blocking enqueue onto a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The payload was queued.
    Queued,
    /// The queue is at capacity; the viewer is not keeping up.
    Full,
    /// The connection handler has gone away.
    Closed,
}

/// A registered viewer connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    remote: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Utf8Bytes>,
    evicted: AtomicBool,
    eviction: Notify,
}

impl Session {
    /// Create a session with an outbound queue of `capacity` payloads.
    ///
    /// Returns the session and the receiver the connection handler drains.
    pub fn new(remote: SocketAddr, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: SessionId::new(),
            remote,
            connected_at: Utc::now(),
            outbound,
            evicted: AtomicBool::new(false),
            eviction: Notify::new(),
        });
        (session, rx)
    }

    /// Unique identifier for this connection.
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address.
    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// When the connection was accepted.
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue a serialized payload without waiting.
    pub fn try_deliver(&self, payload: Utf8Bytes) -> Delivery {
        match self.outbound.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the connection handler to tear this session down.
    pub fn evict(&self) {
        if !self.evicted.swap(true, Ordering::AcqRel) {
            self.eviction.notify_one();
        }
    }

    /// Whether [`evict`](Self::evict) has been called.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Resolve once the session has been evicted.
    pub async fn evicted(&self) {
        if self.is_evicted() {
            return;
        }
        self.eviction.notified().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    #[tokio::test]
    async fn deliver_until_full() {
        let (session, mut rx) = Session::new(addr(), 2);
        assert_eq!(session.try_deliver(Utf8Bytes::from_static("a")), Delivery::Queued);
        assert_eq!(session.try_deliver(Utf8Bytes::from_static("b")), Delivery::Queued);
        assert_eq!(session.try_deliver(Utf8Bytes::from_static("c")), Delivery::Full);

        assert_eq!(rx.recv().await.unwrap().as_str(), "a");
        assert_eq!(session.try_deliver(Utf8Bytes::from_static("d")), Delivery::Queued);
    }

    #[tokio::test]
    async fn deliver_after_receiver_dropped_is_closed() {
        let (session, rx) = Session::new(addr(), 4);
        drop(rx);
        assert_eq!(session.try_deliver(Utf8Bytes::from_static("x")), Delivery::Closed);
    }

    #[tokio::test]
    async fn eviction_wakes_waiter() {
        let (session, _rx) = Session::new(addr(), 1);
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.evicted().await })
        };
        session.evict();
        session.evict();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_evicted());
    }

    #[test]
    fn sessions_have_distinct_ids() {
        let (a, _) = Session::new(addr(), 1);
        let (b, _) = Session::new(addr(), 1);
        assert_ne!(a.id(), b.id());
    }
}
