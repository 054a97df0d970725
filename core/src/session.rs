/// Session state: who is logged in
///
/// Single source of truth for the authenticated identity. The session starts
/// uninitialized; `initialize` resolves the stored credential (if any) and
/// emits the first change. Afterwards `authenticate` and `sign_out` move
/// freely between authenticated and unauthenticated.
///
/// Expiry is checked lazily: `is_authenticated` compares the token's `exp`
/// claim with the wall clock on every call, so an expired token simply reads
/// as unauthenticated without any separate event.
use crate::chat_types::Identity;
use crate::collaborators::AuthApi;
use crate::credential::{Credential, CredentialStore};
use crate::utils::{Subscription, Topic};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Externally visible lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Authenticated,
    Unauthenticated,
}

#[derive(Default)]
struct Inner {
    credential: Option<Credential>,
    identity: Option<Identity>,
}

pub struct SessionState {
    auth: Arc<dyn AuthApi>,
    store: Arc<dyn CredentialStore>,
    inner: RwLock<Inner>,
    changes: Topic<Option<Identity>>,
    initialized: watch::Sender<bool>,
}

impl SessionState {
    pub fn new(auth: Arc<dyn AuthApi>, store: Arc<dyn CredentialStore>) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            auth,
            store,
            inner: RwLock::new(Inner::default()),
            changes: Topic::new(),
            initialized,
        }
    }

    /// Resolve the stored credential. Emits exactly one change.
    pub async fn initialize(&self) {
        if self.is_initialized() {
            debug!("Session already initialized");
            return;
        }

        match self.store.load() {
            Ok(Some(token)) => match Credential::parse(&token) {
                Ok(credential) => self.write().credential = Some(credential),
                Err(e) => {
                    warn!("Discarding unreadable stored credential: {}", e);
                    self.clear_store();
                }
            },
            Ok(None) => debug!("No stored credential"),
            Err(e) => warn!("Could not load stored credential: {}", e),
        }

        self.resolve_identity().await;
    }

    /// Log in. Returns false for rejected credentials and transport errors.
    pub async fn authenticate(&self, username: &str, password: &str) -> bool {
        if self.is_authenticated() {
            return true;
        }

        let token = match self.auth.login(username, password).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!("Authentication rejected for {}", username);
                return false;
            }
            Err(e) => {
                warn!("Authentication request failed: {}", e);
                return false;
            }
        };

        let credential = match Credential::parse(&token) {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Server issued an unreadable token: {}", e);
                return false;
            }
        };

        if let Err(e) = self.store.save(credential.token()) {
            warn!("Could not persist credential: {}", e);
        }
        self.write().credential = Some(credential);

        self.resolve_identity().await;
        self.is_authenticated()
    }

    /// Forget the credential locally, then try to revoke it remotely.
    /// Always returns true: a failed revoke never keeps the user logged in.
    pub async fn sign_out(&self) -> bool {
        let previous = {
            let mut inner = self.write();
            inner.identity = None;
            inner.credential.take()
        };
        self.clear_store();
        self.initialized.send_replace(true);
        self.changes.publish(None);
        info!("Signed out");

        if let Some(credential) = previous {
            if let Err(e) = self.auth.revoke(credential.token()).await {
                warn!("Remote revoke failed, signed out locally only: {}", e);
            }
        }
        true
    }

    /// True iff authenticated and the identity holds at least one of `required`.
    /// An empty requirement is never satisfied.
    pub fn has_right<I, S>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.is_authenticated() {
            return false;
        }
        let inner = self.read();
        match &inner.identity {
            Some(identity) => required
                .into_iter()
                .any(|role| identity.roles.contains(role.as_ref())),
            None => false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read()
            .credential
            .as_ref()
            .map(|c| !c.is_expired())
            .unwrap_or(false)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().identity.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        if !self.is_initialized() {
            SessionPhase::Uninitialized
        } else if self.is_authenticated() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        }
    }

    /// One emission per transition, including the initial resolution
    pub fn changes(&self) -> Subscription<Option<Identity>> {
        self.changes.subscribe()
    }

    /// Wait until the initial resolution happened
    pub async fn wait_initialized(&self) {
        let mut rx = self.initialized.subscribe();
        // The sender lives as long as self, so this only ends on `true`.
        let _ = rx.wait_for(|initialized| *initialized).await;
    }

    /// Raw token of a valid, unexpired credential
    pub(crate) fn bearer_token(&self) -> Option<String> {
        self.read()
            .credential
            .as_ref()
            .filter(|c| !c.is_expired())
            .map(|c| c.token().to_string())
    }

    async fn resolve_identity(&self) {
        let credential = self
            .read()
            .credential
            .clone()
            .filter(|c| !c.is_expired());

        if let Some(credential) = credential {
            match self.auth.current_user(credential.token()).await {
                Ok(mut identity) => {
                    if !credential.roles().is_empty() {
                        identity.roles = credential.roles().iter().cloned().collect();
                    }
                    {
                        let mut inner = self.write();
                        let still_current = inner
                            .credential
                            .as_ref()
                            .map(|c| c.token() == credential.token())
                            .unwrap_or(false);
                        if !still_current {
                            debug!("Credential changed while resolving identity");
                            return;
                        }
                        inner.identity = Some(identity.clone());
                    }
                    info!("Authenticated as {} ({})", identity.display_name, identity.id);
                    self.initialized.send_replace(true);
                    self.changes.publish(Some(identity));
                    return;
                }
                Err(e) => {
                    warn!("Could not resolve identity, dropping credential: {}", e);
                }
            }
        }

        {
            let mut inner = self.write();
            inner.credential = None;
            inner.identity = None;
        }
        self.clear_store();
        self.initialized.send_replace(true);
        self.changes.publish(None);
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Could not clear stored credential: {}", e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_types::UserId;
    use crate::credential::{encode_unsigned_token, MemoryCredentialStore};
    use crate::error::{ChatError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAuth {
        token: String,
        revoke_fails: bool,
        revokes: AtomicUsize,
    }

    impl FakeAuth {
        fn new(roles: &[&str]) -> Self {
            Self {
                token: encode_unsigned_token("ada", None, roles),
                revoke_fails: false,
                revokes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AuthApi for FakeAuth {
        async fn login(&self, username: &str, password: &str) -> Result<Option<String>> {
            match (username, password) {
                ("ada", "secret") => Ok(Some(self.token.clone())),
                ("down", _) => Err(ChatError::Connection("refused".into())),
                _ => Ok(None),
            }
        }

        async fn current_user(&self, token: &str) -> Result<Identity> {
            if token == self.token {
                Ok(Identity::new(1, "Ada"))
            } else {
                Err(ChatError::HttpStatus { status: 401, path: "/api/user/me".into() })
            }
        }

        async fn revoke(&self, _token: &str) -> Result<()> {
            self.revokes.fetch_add(1, Ordering::SeqCst);
            if self.revoke_fails {
                Err(ChatError::Connection("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    fn session(auth: FakeAuth, store: MemoryCredentialStore) -> SessionState {
        SessionState::new(Arc::new(auth), Arc::new(store))
    }

    #[tokio::test]
    async fn test_initialize_without_stored_credential() {
        let session = session(FakeAuth::new(&[]), MemoryCredentialStore::new());
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        let mut changes = session.changes();

        session.initialize().await;

        assert!(session.is_initialized());
        assert!(!session.is_authenticated());
        assert_eq!(changes.drain(), vec![None]);
        assert_eq!(session.phase(), SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_initialize_with_stored_credential() {
        let auth = FakeAuth::new(&["ROLE_USER"]);
        let store = MemoryCredentialStore::with_token(auth.token.clone());
        let session = session(auth, store);
        let mut changes = session.changes();

        session.initialize().await;

        let emitted = changes.drain();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].as_ref().map(|i| i.id), Some(UserId(1)));
        assert!(session.has_right(["ROLE_USER"]));
    }

    #[tokio::test]
    async fn test_stale_stored_credential_is_dropped() {
        let store = Arc::new(MemoryCredentialStore::with_token(encode_unsigned_token(
            "someone-else",
            None,
            &[],
        )));
        let session = SessionState::new(Arc::new(FakeAuth::new(&[])), store.clone());

        session.initialize().await;

        assert!(!session.is_authenticated());
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_stored_credential_reads_unauthenticated() {
        let store = MemoryCredentialStore::with_token(encode_unsigned_token("ada", Some(1), &[]));
        let session = session(FakeAuth::new(&[]), store);
        session.initialize().await;
        assert!(!session.is_authenticated());
        assert!(session.identity().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_outcomes() {
        let session = session(FakeAuth::new(&[]), MemoryCredentialStore::new());
        session.initialize().await;

        assert!(!session.authenticate("ada", "wrong").await);
        assert!(!session.authenticate("down", "x").await);
        assert!(session.authenticate("ada", "secret").await);
        assert_eq!(session.identity().map(|i| i.display_name), Some("Ada".to_string()));
        // Already authenticated short-circuits
        assert!(session.authenticate("ada", "wrong").await);
    }

    #[tokio::test]
    async fn test_has_right_with_empty_requirement_is_false() {
        let session = session(FakeAuth::new(&["user"]), MemoryCredentialStore::new());
        session.initialize().await;
        assert!(session.authenticate("ada", "secret").await);

        let none: [&str; 0] = [];
        assert!(!session.has_right(none));
        assert!(session.has_right(["admin", "user"]));
        assert!(!session.has_right(["admin"]));
    }

    #[tokio::test]
    async fn test_has_right_unauthenticated_is_false() {
        let session = session(FakeAuth::new(&["user"]), MemoryCredentialStore::new());
        session.initialize().await;
        assert!(!session.has_right(["user"]));
    }

    #[tokio::test]
    async fn test_sign_out_succeeds_when_revoke_fails() {
        let mut auth = FakeAuth::new(&[]);
        auth.revoke_fails = true;
        let auth = Arc::new(auth);
        let store = Arc::new(MemoryCredentialStore::new());
        let session = SessionState::new(auth.clone(), store.clone());
        session.initialize().await;
        assert!(session.authenticate("ada", "secret").await);
        let mut changes = session.changes();

        assert!(session.sign_out().await);

        assert!(!session.is_authenticated());
        assert!(session.identity().is_none());
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(changes.drain(), vec![None]);
        assert_eq!(auth.revokes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_initialized_resolves_after_initialize() {
        let session = Arc::new(session(FakeAuth::new(&[]), MemoryCredentialStore::new()));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_initialized().await })
        };
        session.initialize().await;
        waiter.await.unwrap();
        assert!(session.is_initialized());
    }
}
