//! Broadcast fan-out from the run controller to every viewer.
//!
//! Each message is serialized once and the same bytes are enqueued on
//! every registered session's outbound queue. Enqueueing never waits: a
//! session whose queue is full (a slow viewer) or closed (a departed
//! handler) is unregistered and told to evict itself, and the broadcast
//! carries on with the rest.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use relay_core::controller::FramePublisher;
use relay_types::ServerMessage;
use tracing::{debug, warn};

use crate::registry::SessionRegistry;
use crate::session::Delivery;

/// Delivers controller messages to all sessions in a [`SessionRegistry`].
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Serialize `message` once and enqueue it on every session.
    ///
    /// Returns the number of sessions the payload was queued for.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let payload = match message.encode() {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };

        let mut queued: usize = 0;
        let mut dropped = Vec::new();

        self.registry
            .for_each(|session| match session.try_deliver(payload.clone()) {
                Delivery::Queued => queued = queued.saturating_add(1),
                outcome @ (Delivery::Full | Delivery::Closed) => {
                    debug!(
                        session = %session.id(),
                        remote = %session.remote(),
                        ?outcome,
                        "Dropping session from broadcast"
                    );
                    dropped.push(Arc::clone(session));
                }
            })
            .await;

        for session in dropped {
            let _ = self.registry.unregister(session.id()).await;
            session.evict();
        }

        queued
    }
}

impl FramePublisher for Broadcaster {
    fn publish<'a>(&'a self, message: &'a ServerMessage) -> BoxFuture<'a, usize> {
        self.broadcast(message).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::net::SocketAddr;

    use relay_types::{Frame, StepSnapshot};

    use super::*;
    use crate::session::Session;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 51000))
    }

    fn update(step: u64) -> ServerMessage {
        ServerMessage::Update(Frame::from_snapshot(step, StepSnapshot::default()))
    }

    #[tokio::test]
    async fn every_session_gets_the_same_bytes() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut rx_a) = Session::new(addr(), 4);
        let (b, mut rx_b) = Session::new(addr(), 4);
        let _ = registry.register(a).await;
        let _ = registry.register(b).await;

        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        assert_eq!(broadcaster.broadcast(&update(7)).await, 2);

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.as_str(), got_b.as_str());
        let json: serde_json::Value = serde_json::from_str(got_a.as_str()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["step"], 7);
    }

    #[tokio::test]
    async fn full_session_is_evicted_without_affecting_others() {
        let registry = Arc::new(SessionRegistry::new());
        let (slow, _slow_rx) = Session::new(addr(), 1);
        let (fast, mut fast_rx) = Session::new(addr(), 8);
        let _ = registry.register(Arc::clone(&slow)).await;
        let _ = registry.register(Arc::clone(&fast)).await;

        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        assert_eq!(broadcaster.broadcast(&update(0)).await, 2);
        assert_eq!(broadcaster.broadcast(&update(1)).await, 1);

        assert!(slow.is_evicted());
        assert!(!fast.is_evicted());
        assert_eq!(registry.len().await, 1);

        assert_eq!(broadcaster.broadcast(&update(2)).await, 1);
        for expected in 0..3 {
            let got = fast_rx.recv().await.unwrap();
            let json: serde_json::Value = serde_json::from_str(got.as_str()).unwrap();
            assert_eq!(json["step"], expected);
        }
    }

    #[tokio::test]
    async fn closed_session_is_unregistered() {
        let registry = Arc::new(SessionRegistry::new());
        let (gone, rx) = Session::new(addr(), 4);
        let _ = registry.register(Arc::clone(&gone)).await;
        drop(rx);

        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        assert_eq!(broadcaster.publish(&update(0)).await, 0);
        assert!(registry.is_empty().await);
        assert!(gone.is_evicted());
    }

    #[tokio::test]
    async fn empty_registry_is_not_an_error() {
        let broadcaster = Broadcaster::new(Arc::new(SessionRegistry::new()));
        assert_eq!(broadcaster.broadcast(&update(0)).await, 0);
    }
}
