//! Session ownership filter for `Lock`/`Unlock` signals.
//!
//! logind broadcasts these for every session on the seat; only the ones for
//! sessions owned by the user running the daemon are accepted.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{HookError, Strategy};
use crate::domain::RawSignal;

/// Resolves the owning user name of a session object.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    /// Open the connection used for lookups.
    ///
    /// Lookups must not share a connection with a signal subscription: a
    /// backlog of unread signals would stall the reply.
    async fn connect(&mut self) -> Result<(), HookError>;

    async fn session_user(&self, session_path: &str) -> Result<String>;
}

/// Strategy accepting signals from the current user's sessions.
pub struct SessionStrategy<L: SessionLookup> {
    lookup: L,
    username: String,
}

impl<L: SessionLookup> SessionStrategy<L> {
    pub fn new(lookup: L, username: impl Into<String>) -> Self {
        Self {
            lookup,
            username: username.into(),
        }
    }
}

#[async_trait]
impl<L: SessionLookup> Strategy for SessionStrategy<L> {
    async fn init(&mut self) -> Result<(), HookError> {
        self.lookup.connect().await
    }

    async fn verify(&mut self, signal: &RawSignal) -> Result<bool, HookError> {
        let owner = match self.lookup.session_user(&signal.path).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!("Could not obtain details for session: {:#}", e);
                return Ok(false);
            }
        };

        if owner != self.username {
            debug!(
                "Ignoring {} for {} (owned by {})",
                signal.member, signal.path, owner
            );
            return Ok(false);
        }

        info!("Session signal for current user: {}", signal.member);
        Ok(true)
    }
}
