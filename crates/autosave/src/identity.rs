//! Identity provider seam.
//!
//! Authentication itself is out of scope; the sync core only needs to know
//! who is signed in and to hear about changes so it can re-scope its queue,
//! cache, and status.

use store::UserId;
use tokio::sync::watch;

/// Source of the signed-in user.
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, if any
    fn current_user_id(&self) -> Option<UserId>;

    /// Watch sign-in / sign-out transitions
    fn subscribe(&self) -> watch::Receiver<Option<UserId>>;
}

/// In-process identity provider.
///
/// Stands in for the hosted auth service in tests and in the local harness.
pub struct LocalIdentity {
    current: watch::Sender<Option<UserId>>,
}

impl LocalIdentity {
    /// Create a provider with nobody signed in
    pub fn new() -> Self {
        Self {
            current: watch::channel(None).0,
        }
    }

    /// Create a provider with `user` already signed in
    pub fn signed_in(user: impl Into<UserId>) -> Self {
        Self {
            current: watch::channel(Some(user.into())).0,
        }
    }

    /// Sign `user` in, replacing whoever was signed in
    pub fn sign_in(&self, user: impl Into<UserId>) {
        let user = user.into();
        tracing::info!(%user, "Signed in");
        self.current.send_if_modified(|current| {
            if current.as_ref() == Some(&user) {
                false
            } else {
                *current = Some(user);
                true
            }
        });
    }

    /// Sign the current user out
    pub fn sign_out(&self) {
        self.current.send_if_modified(|current| {
            if let Some(user) = current.take() {
                tracing::info!(%user, "Signed out");
                true
            } else {
                false
            }
        });
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for LocalIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        self.current.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.current.subscribe()
    }
}
