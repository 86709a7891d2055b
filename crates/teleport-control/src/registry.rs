//! Live client sessions keyed by identity

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use teleport_auth::SubscriptionTier;
use teleport_crypto::SessionCipher;
use teleport_relay::RelayMode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::admission::AdmissionController;

/// State of one authenticated control connection
#[derive(Debug)]
pub struct ClientSession {
    pub session_id: Uuid,
    pub identity: String,
    pub tier: SubscriptionTier,
    pub subdomain: String,
    pub public_host: String,
    pub admission: Arc<AdmissionController>,
    /// Present when the session negotiated encryption. Fixed for the session lifetime.
    pub cipher: Option<SessionCipher>,
    /// Cancelled when the session ends or is replaced
    pub shutdown: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn relay_mode(&self) -> RelayMode {
        match &self.cipher {
            Some(cipher) => RelayMode::Encrypted(cipher.clone()),
            None => RelayMode::Plain,
        }
    }
}

/// Registry of live sessions, at most one per identity
///
/// Entries are owned by the task that inserted them and removed through the
/// [`SessionGuard`] it holds, on every exit path.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, replacing and shutting down any live session for the same identity.
    pub fn insert(self: &Arc<Self>, session: Arc<ClientSession>) -> SessionGuard {
        let guard = SessionGuard {
            registry: self.clone(),
            identity: session.identity.clone(),
            session_id: session.session_id,
        };

        if let Some(previous) = self.sessions.insert(session.identity.clone(), session) {
            info!(
                identity = %previous.identity,
                public_host = %previous.public_host,
                "Replacing existing session"
            );
            previous.shutdown.cancel();
        }

        guard
    }

    pub fn get(&self, identity: &str) -> Option<Arc<ClientSession>> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove the entry for `identity` only if it is still `session_id`.
    ///
    /// A replaced session must not evict its successor.
    pub fn remove_if_current(&self, identity: &str, session_id: Uuid) -> bool {
        let removed = self
            .sessions
            .remove_if(identity, |_, session| session.session_id == session_id)
            .is_some();
        if removed {
            debug!(identity, %session_id, "Session removed from registry");
        }
        removed
    }
}

/// Removes its registry entry when dropped
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    identity: String,
    session_id: Uuid,
}

impl SessionGuard {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .remove_if_current(&self.identity, self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionPolicy;
    use teleport_auth::TierLimits;

    fn session(identity: &str) -> Arc<ClientSession> {
        Arc::new(ClientSession {
            session_id: Uuid::new_v4(),
            identity: identity.to_string(),
            tier: SubscriptionTier::Free,
            subdomain: format!("teleport-{}-abc", identity),
            public_host: format!("teleport-{}-abc.localhost", identity),
            admission: Arc::new(AdmissionController::new(
                TierLimits::uniform(2),
                AdmissionPolicy::Stop,
            )),
            cipher: None,
            shutdown: CancellationToken::new(),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn test_guard_removes_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.insert(session("alice"));

        assert!(registry.contains("alice"));
        assert!(matches!(registry.get("alice"), Some(s) if s.session_id == guard.session_id()));

        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replacement_cancels_previous_session() {
        let registry = Arc::new(SessionRegistry::new());
        let first = session("alice");
        let first_guard = registry.insert(first.clone());
        let second = session("alice");
        let second_guard = registry.insert(second.clone());

        assert!(first.shutdown.is_cancelled());
        assert!(!second.shutdown.is_cancelled());
        assert_eq!(registry.len(), 1);

        // The replaced session's cleanup leaves its successor in place.
        drop(first_guard);
        assert_eq!(
            registry.get("alice").map(|s| s.session_id),
            Some(second.session_id)
        );

        drop(second_guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sequential_sessions_leave_no_residue() {
        let registry = Arc::new(SessionRegistry::new());
        for i in 0..100 {
            let guard = registry.insert(session(&format!("user{}", i % 7)));
            assert_eq!(registry.len(), 1);
            drop(guard);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_relay_mode_follows_cipher() {
        let plain = session("bob");
        assert!(!plain.relay_mode().is_encrypted());
    }
}
