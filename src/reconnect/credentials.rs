use std::fmt;

use tokio::sync::watch;

/// Bearer credential plus the identity it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub user_id: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Host-owned credential provider. `set` is a refresh, `clear` is a logout.
/// Every controller watches it and restarts its connection on change.
#[derive(Clone)]
pub struct CredentialSource {
    tx: watch::Sender<Option<Credential>>,
}

impl CredentialSource {
    pub fn new(initial: Option<Credential>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

impl Default for CredentialSource {
    fn default() -> Self {
        Self::new(None)
    }
}
