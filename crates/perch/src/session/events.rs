//! Messages flowing into and out of the session engine.
//!
//! The engine owns all session state and runs on one task. Everything else
//! talks to it through these types:
//!
//! - `EngineCommand`: sent by the link, the pollers, and finished worker jobs
//! - `RemoteEvent`/`RemoteOutcome`: a worker job's result, tagged with the
//!   user it belongs to so stale results can be discarded
//! - `SessionSummary`: read-only snapshot served over the status endpoint

use chrono::{DateTime, Utc};
use perch_link_protocol::LinkEvent;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::remote::{AccessGrant, ApiResult, DirectMessage, RemoteUser, RequestToken, Status};
use crate::session::{ConnectionState, CursorKind, DisplayMode};

/// Buffered commands the engine accepts before senders start waiting.
pub const COMMAND_CAPACITY: usize = 256;

/// Buffered outbound link commands before the engine starts dropping them.
pub const OUTBOUND_CAPACITY: usize = 256;

// ============================================================================
// Commands
// ============================================================================

/// A unit of work for the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// An event decoded from the messaging-network link.
    Link(LinkEvent),

    /// A poll timer fired for one pipeline; the engine fans it out over
    /// connected sessions.
    PollTick { kind: CursorKind },

    /// A worker job finished.
    Remote(RemoteEvent),

    /// Snapshot all sessions for the status endpoint.
    Sessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },

    /// Disconnect every session and stop the loop.
    Shutdown { reply: oneshot::Sender<()> },
}

/// A finished remote call, routed back to the session that asked for it.
#[derive(Debug)]
pub struct RemoteEvent {
    /// Messaging-network address the job was started for.
    pub user: String,
    pub outcome: RemoteOutcome,
}

/// What a worker job produced.
///
/// Every remote call the engine submits comes back as exactly one of these,
/// error or not. Results for sessions that have since logged out are
/// discarded by the engine.
#[derive(Debug)]
pub enum RemoteOutcome {
    /// Outcome of requesting an authorization token for the PIN flow.
    RequestToken(ApiResult<RequestToken>),
    /// Outcome of trading a user-supplied PIN for an access token.
    PinExchange(ApiResult<AccessGrant>),
    /// Outcome of validating stored credentials at login.
    Verify(ApiResult<RemoteUser>),
    /// A page of statuses newer than the cursor the fetch was started with.
    Timeline(ApiResult<Vec<Status>>),
    /// A page of direct messages newer than the cursor.
    DirectMessages(ApiResult<Vec<DirectMessage>>),
    /// Outcome of publishing a status.
    Posted(ApiResult<Status>),
    /// Outcome of sending a direct message.
    DmSent(ApiResult<DirectMessage>),
    /// Outcome of a follow call; carries the followed account.
    Followed(ApiResult<RemoteUser>),
    /// Outcome of an unfollow call; carries the unfollowed account.
    Unfollowed(ApiResult<RemoteUser>),
    /// The accounts the user currently follows, for roster reconciliation.
    Friends(ApiResult<Vec<RemoteUser>>),
    /// Raw avatar bytes for a profile-card request.
    Avatar {
        request_id: u32,
        target: String,
        result: ApiResult<Vec<u8>>,
    },
}

impl RemoteOutcome {
    /// Short name for logging.
    pub fn label(&self) -> &'static str {
        match self {
            RemoteOutcome::RequestToken(_) => "request_token",
            RemoteOutcome::PinExchange(_) => "pin_exchange",
            RemoteOutcome::Verify(_) => "verify",
            RemoteOutcome::Timeline(_) => "timeline",
            RemoteOutcome::DirectMessages(_) => "direct_messages",
            RemoteOutcome::Posted(_) => "posted",
            RemoteOutcome::DmSent(_) => "dm_sent",
            RemoteOutcome::Followed(_) => "followed",
            RemoteOutcome::Unfollowed(_) => "unfollowed",
            RemoteOutcome::Friends(_) => "friends",
            RemoteOutcome::Avatar { .. } => "avatar",
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Read-only view of one session, served over the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,
    pub state: ConnectionState,
    pub mode: DisplayMode,
    pub buddies: usize,
    pub status_cursor: u64,
    pub dm_cursor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by `EngineHandle` calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is shut down")]
    EngineShutdown,
}
