//! Set of currently connected viewer sessions.
//!
//! The registry is shared by every connection handler (which registers
//! and unregisters its own session) and the fan-out (which iterates it
//! once per frame). Iteration works on a snapshot taken under a short
//! read lock, so a session joining or leaving mid-broadcast never blocks
//! or breaks delivery to the others.

use std::collections::HashMap;
use std::sync::Arc;

use relay_types::SessionId;
use tokio::sync::RwLock;

use crate::session::Session;

/// Concurrency-safe map of live sessions keyed by [`SessionId`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` if it was already registered.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        let id = session.id();
        if sessions.contains_key(&id) {
            return false;
        }
        let _ = sessions.insert(id, session);
        true
    }

    /// Remove a session. Safe to call for sessions that are already gone.
    pub async fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    /// Copy of the current membership.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Run `f` on every session in a snapshot of the current membership.
    ///
    /// The lock is released before `f` is called.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Session>),
    {
        for session in &self.snapshot().await {
            f(session);
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn session() -> Arc<Session> {
        Session::new(SocketAddr::from(([127, 0, 0, 1], 50000)), 4).0
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = SessionRegistry::new();
        let s = session();
        assert!(registry.register(Arc::clone(&s)).await);
        assert!(!registry.register(Arc::clone(&s)).await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.snapshot().await.first().unwrap().id(), s.id());
    }

    #[tokio::test]
    async fn unregister_twice_is_harmless() {
        let registry = SessionRegistry::new();
        let s = session();
        let _ = registry.register(Arc::clone(&s)).await;

        assert!(registry.unregister(s.id()).await.is_some());
        assert!(registry.unregister(s.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn for_each_may_mutate_registry() {
        let registry = Arc::new(SessionRegistry::new());
        for _ in 0..3 {
            let _ = registry.register(session()).await;
        }

        let mut visited = Vec::new();
        registry
            .for_each(|s| {
                visited.push(s.id());
            })
            .await;
        assert_eq!(visited.len(), 3);

        // The snapshot is detached: removing while iterating it is fine.
        for s in registry.snapshot().await {
            let _ = registry.unregister(s.id()).await;
        }
        assert!(registry.is_empty().await);
    }
}
