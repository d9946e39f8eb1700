//! User-record storage trait.
//!
//! A user record outlives the in-memory session: it holds everything needed
//! to resume a user after a gateway restart without a fresh PIN handshake or
//! re-delivery of already-seen content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::remote::Credentials;
use crate::session::{CursorKind, DisplayMode};

use super::error::StorageResult;

/// Persisted state for one gateway user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// OAuth access token, absent until the PIN exchange completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// OAuth access-token secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Remote-service screen name, cached from the last login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,

    /// Highest status id already delivered to the user.
    #[serde(default)]
    pub status_cursor: u64,

    /// Highest direct-message id already delivered to the user.
    #[serde(default)]
    pub dm_cursor: u64,

    /// Display mode chosen by the user, absent until first set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DisplayMode>,

    /// Whether this user was registered under the deprecated identity
    /// scheme. Affects roster key formatting only.
    #[serde(default)]
    pub legacy_scheme: bool,
}

impl UserRecord {
    /// Stored OAuth credentials, if the user has completed authentication.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.token, &self.secret) {
            (Some(token), Some(secret)) => Some(Credentials {
                token: token.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    /// The cursor value for one poll kind.
    pub fn cursor(&self, kind: CursorKind) -> u64 {
        match kind {
            CursorKind::Status => self.status_cursor,
            CursorKind::DirectMessage => self.dm_cursor,
        }
    }
}

/// Storage backend for user records.
///
/// A missing record is not an error: reads return defaults so a first-time
/// login proceeds straight into the PIN handshake.
#[async_trait]
pub trait UserStore: Send + Sync {
    // ========================================================================
    // Bulk access
    // ========================================================================

    /// Load the full record for a user, defaulted when absent.
    async fn record(&self, user: &str) -> StorageResult<UserRecord>;

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Stored OAuth credentials, absent until the PIN exchange completes.
    async fn credentials(&self, user: &str) -> StorageResult<Option<Credentials>>;

    /// Persist OAuth credentials after a successful exchange.
    async fn set_credentials(&self, user: &str, credentials: &Credentials) -> StorageResult<()>;

    // ========================================================================
    // Poll cursors
    // ========================================================================

    /// The last-delivered item id for one poll kind, `0` when nothing has
    /// been delivered yet.
    async fn cursor(&self, user: &str, kind: CursorKind) -> StorageResult<u64>;

    /// Persist a cursor advance.
    async fn set_cursor(&self, user: &str, kind: CursorKind, id: u64) -> StorageResult<()>;

    // ========================================================================
    // Display mode and identity
    // ========================================================================

    /// The user's chosen display mode, absent until first set.
    async fn mode(&self, user: &str) -> StorageResult<Option<DisplayMode>>;

    /// Persist a display-mode change.
    async fn set_mode(&self, user: &str, mode: DisplayMode) -> StorageResult<()>;

    /// Whether the user was registered under the deprecated identity scheme.
    async fn is_legacy_user(&self, user: &str) -> StorageResult<bool>;

    /// Cache the remote-service screen name for the user.
    async fn set_screen_name(&self, user: &str, screen_name: &str) -> StorageResult<()>;
}
