//! Session bookkeeping for the credential trampoline.
//!
//! Every git invocation that may need credentials gets an ephemeral
//! token. The askpass/credential-helper IPC layer (owned by the host
//! application) looks sessions up by that token to decide how to answer
//! credential requests; this registry is the shared surface between the
//! two. Tokens are never reused and never outlive their invocation.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use uuid::Uuid;

/// Opaque, unguessable per-invocation token. Carried by child processes
/// in an environment variable and echoed back over the IPC channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata registered alongside a token when its invocation starts.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    /// Process working directory of the git invocation.
    pub working_directory: PathBuf,
    /// Background operations must never pop credential prompts.
    pub is_background_task: bool,
}

#[derive(Debug, Default)]
struct Session {
    meta: Option<SessionMetadata>,
    /// Endpoints for which the user declined (or we failed) to provide
    /// credentials during this invocation.
    rejected_endpoints: HashSet<String>,
    /// The SSH key the askpass handler most recently served a passphrase
    /// for, so a failed invocation can evict exactly that cache entry.
    most_recent_ssh_key: Option<String>,
}

/// Process-wide registry of live trampoline sessions plus the in-memory
/// SSH passphrase cache. Explicitly owned and injected (construct one,
/// share it via `Arc`) so tests get isolated instances.
#[derive(Debug, Default)]
pub struct TrampolineSessions {
    sessions: Mutex<HashMap<SessionToken, Session>>,
    passphrases: Mutex<HashMap<String, String>>,
}

impl TrampolineSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_session(&self, token: SessionToken, meta: SessionMetadata) {
        self.lock_sessions().entry(token).or_default().meta = Some(meta);
    }

    pub fn session_metadata(&self, token: &SessionToken) -> Option<SessionMetadata> {
        self.lock_sessions().get(token).and_then(|s| s.meta.clone())
    }

    /// Remove every trace of the token. Retiring an unknown or already
    /// retired token is a no-op.
    pub fn retire_session(&self, token: &SessionToken) {
        self.lock_sessions().remove(token);
    }

    pub fn record_rejected_credential(&self, token: &SessionToken, endpoint: &str) {
        self.lock_sessions()
            .entry(token.clone())
            .or_default()
            .rejected_endpoints
            .insert(endpoint.to_string());
    }

    pub fn was_credential_rejected(&self, token: &SessionToken, endpoint: &str) -> bool {
        self.lock_sessions()
            .get(token)
            .is_some_and(|s| s.rejected_endpoints.contains(endpoint))
    }

    pub(crate) fn has_rejected_credentials(&self, token: &SessionToken) -> bool {
        self.lock_sessions()
            .get(token)
            .is_some_and(|s| !s.rejected_endpoints.is_empty())
    }

    /// Called by the askpass handler after serving a passphrase, so the
    /// failure path knows which cache entry to evict.
    pub fn set_most_recent_ssh_key(&self, token: &SessionToken, key_path: &str) {
        self.lock_sessions()
            .entry(token.clone())
            .or_default()
            .most_recent_ssh_key = Some(key_path.to_string());
    }

    pub fn remember_passphrase(&self, key_path: &str, passphrase: &str) {
        self.lock_passphrases()
            .insert(key_path.to_string(), passphrase.to_string());
    }

    pub fn passphrase(&self, key_path: &str) -> Option<String> {
        self.lock_passphrases().get(key_path).cloned()
    }

    pub fn forget_passphrase(&self, key_path: &str) {
        self.lock_passphrases().remove(key_path);
    }

    /// Evict the passphrase for the token's most recently used key. This
    /// is a best-effort heuristic: the askpass protocol doesn't tell us
    /// which credential attempt actually failed.
    pub(crate) fn forget_most_recent_passphrase(&self, token: &SessionToken) {
        let key = self
            .lock_sessions()
            .get_mut(token)
            .and_then(|s| s.most_recent_ssh_key.take());
        if let Some(key) = key {
            self.lock_passphrases().remove(&key);
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionToken, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_passphrases(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.passphrases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Retires the session when dropped, so cleanup happens on every exit
/// path of an invocation, early returns and panics included.
pub(crate) struct RetireGuard {
    sessions: Arc<TrampolineSessions>,
    token: SessionToken,
}

impl RetireGuard {
    pub(crate) fn new(sessions: Arc<TrampolineSessions>, token: SessionToken) -> Self {
        Self { sessions, token }
    }
}

impl Drop for RetireGuard {
    fn drop(&mut self) {
        self.sessions.retire_session(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(background: bool) -> SessionMetadata {
        SessionMetadata {
            working_directory: PathBuf::from("/tmp/repo"),
            is_background_task: background,
        }
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(SessionToken::mint(), SessionToken::mint());
    }

    #[test]
    fn retire_is_idempotent_and_isolated() {
        let sessions = TrampolineSessions::new();
        let a = SessionToken::mint();
        let b = SessionToken::mint();
        sessions.register_session(a.clone(), meta(false));
        sessions.register_session(b.clone(), meta(true));

        sessions.retire_session(&a);
        sessions.retire_session(&a);

        assert!(sessions.session_metadata(&a).is_none());
        let b_meta = sessions.session_metadata(&b).expect("b survives");
        assert!(b_meta.is_background_task);
    }

    #[test]
    fn rejected_credentials_are_per_token() {
        let sessions = TrampolineSessions::new();
        let a = SessionToken::mint();
        let b = SessionToken::mint();
        sessions.record_rejected_credential(&a, "https://github.com");
        assert!(sessions.was_credential_rejected(&a, "https://github.com"));
        assert!(!sessions.was_credential_rejected(&a, "https://example.com"));
        assert!(!sessions.was_credential_rejected(&b, "https://github.com"));
    }

    #[test]
    fn forgetting_most_recent_passphrase_evicts_cache() {
        let sessions = TrampolineSessions::new();
        let token = SessionToken::mint();
        sessions.remember_passphrase("/home/me/.ssh/id_ed25519", "hunter2");
        sessions.set_most_recent_ssh_key(&token, "/home/me/.ssh/id_ed25519");

        sessions.forget_most_recent_passphrase(&token);
        assert_eq!(sessions.passphrase("/home/me/.ssh/id_ed25519"), None);

        // A second eviction has nothing to do and must not panic.
        sessions.forget_most_recent_passphrase(&token);
    }

    #[test]
    fn drop_guard_retires() {
        let sessions = TrampolineSessions::new();
        let token = SessionToken::mint();
        sessions.register_session(token.clone(), meta(false));
        {
            let _guard = RetireGuard::new(Arc::clone(&sessions), token.clone());
        }
        assert!(sessions.session_metadata(&token).is_none());
    }
}
