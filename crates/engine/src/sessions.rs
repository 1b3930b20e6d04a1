//! Registry of live viewing sessions.
//!
//! Sessions are keyed by an opaque caller-supplied id (one per open panel)
//! and hold only cooperative UI state. The registry is consulted on inbound
//! delivery to decide whether a thread is currently on screen, which is what
//! suppresses the unread flag.

use std::collections::HashMap;

use tokio::sync::RwLock;

use omnichat_core::domain::thread::ThreadId;
use omnichat_core::session::SessionState;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the named session, creating it on first touch.
    pub async fn with_session<F, R>(&self, key: &str, f: F) -> R
    where
        F: FnOnce(&mut SessionState) -> R,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key.to_string()).or_default();
        f(session)
    }

    pub async fn snapshot(&self, key: &str) -> SessionState {
        let sessions = self.sessions.read().await;
        sessions.get(key).cloned().unwrap_or_default()
    }

    /// True when any session has `thread` open in live mode.
    pub async fn is_thread_in_view(&self, thread: &ThreadId) -> bool {
        let sessions = self.sessions.read().await;
        sessions.values().any(|session| session.is_viewing_live(thread))
    }

    /// Scrubs a deleted thread from every session.
    pub async fn forget_thread(&self, thread: &ThreadId) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            session.forget_thread(thread);
        }
    }
}
