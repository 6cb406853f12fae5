//! Authentication signal.
//!
//! The engines only care about who is signed in, if anyone. The provider
//! publishes that through a `watch` channel; every change is a transition.

use tokio::sync::watch;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    SignedOut,
    SignedIn { owner_id: String },
}

impl AuthState {
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            AuthState::SignedOut => None,
            AuthState::SignedIn { owner_id } => Some(owner_id),
        }
    }
}

/// In-process auth source
pub struct AuthProvider {
    tx: watch::Sender<AuthState>,
}

impl Default for AuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AuthState::SignedOut);
        Self { tx }
    }

    pub fn sign_in(&self, owner_id: &str) -> Result<()> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(SyncError::NotAuthenticated);
        }
        let next = AuthState::SignedIn {
            owner_id: owner_id.to_string(),
        };
        self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        Ok(())
    }

    pub fn sign_out(&self) {
        self.tx.send_if_modified(|state| {
            if *state == AuthState::SignedOut {
                return false;
            }
            *state = AuthState::SignedOut;
            true
        });
    }

    pub fn current(&self) -> AuthState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }
}
