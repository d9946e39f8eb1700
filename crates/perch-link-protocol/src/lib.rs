//! Link protocol types for communication between perch and a transport process.
//!
//! The transport terminates the federated messaging network (connections,
//! stanzas, roster pushes) and relays user actions to perch. Use this crate
//! to build a transport binding in Rust.
//!
//! # Protocol Overview
//!
//! The protocol is bidirectional with JSON Lines (newline-delimited JSON)
//! over a TCP connection:
//!
//! - **Events** (Transport → perch): user actions forwarded to the gateway
//! - **Commands** (perch → Transport): deliveries, roster operations and
//!   presence for the transport to push to the user
//!
//! # Example: Minimal Transport
//!
//! ```ignore
//! use perch_link_protocol::{LinkCommand, LinkEvent};
//!
//! // Send events on the socket
//! let event = LinkEvent::Login {
//!     user: "alice@example.org".to_string(),
//!     legacy_name: "alice".to_string(),
//!     password: None,
//! };
//! writeln!(socket, "{}", serde_json::to_string(&event)?);
//!
//! // Read commands from the socket
//! let line = read_line(&mut socket)?;
//! let command: LinkCommand = serde_json::from_str(&line)?;
//! ```

use serde::{Deserialize, Serialize};

// ============================================================================
// Events (Transport → perch)
// ============================================================================

/// User actions forwarded by the transport to perch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
    /// A user logged in on the messaging network.
    ///
    /// `legacy_name` is the remote-service screen name the user registered
    /// with. `password` is unused for fresh registrations (authentication is
    /// a PIN exchange), but a transport may pass a PIN through it when the
    /// user re-submits credentials mid-handshake.
    Login {
        user: String,
        legacy_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// The user logged out; tear the session down.
    Logout { user: String },

    /// The user sent a message to a contact or room.
    SendMessage {
        user: String,
        target: String,
        body: String,
    },

    /// The user added a contact on the messaging side.
    BuddyAdded { user: String, buddy: String },

    /// The user removed a contact on the messaging side.
    BuddyRemoved { user: String, buddy: String },

    /// The user requested a contact's vCard (profile + avatar).
    ///
    /// The response is matched back by `request_id`.
    VcardRequest {
        user: String,
        target: String,
        request_id: u32,
    },

    /// The user joined a chatroom exposed by the gateway.
    JoinRoom {
        user: String,
        room: String,
        nickname: String,
    },

    /// The user left a chatroom.
    LeaveRoom { user: String, room: String },
}

impl LinkEvent {
    /// The gateway user this event concerns.
    pub fn user(&self) -> &str {
        match self {
            LinkEvent::Login { user, .. }
            | LinkEvent::Logout { user }
            | LinkEvent::SendMessage { user, .. }
            | LinkEvent::BuddyAdded { user, .. }
            | LinkEvent::BuddyRemoved { user, .. }
            | LinkEvent::VcardRequest { user, .. }
            | LinkEvent::JoinRoom { user, .. }
            | LinkEvent::LeaveRoom { user, .. } => user,
        }
    }
}

// ============================================================================
// Commands (perch → Transport)
// ============================================================================

/// Instructions from perch for the transport to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkCommand {
    /// Deliver a message to the user, attributed to `from`.
    ///
    /// When `room` is set the message is a room message and `from` is the
    /// occupant nickname; otherwise it is a private message from the contact
    /// named `from`.
    DeliverMessage {
        user: String,
        from: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        /// Raw remote-service timestamp, passed through untouched.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// Add (or update) a contact on the user's roster.
    RosterAdd {
        user: String,
        buddy: String,
        alias: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },

    /// Remove a contact from the user's roster.
    RosterRemove { user: String, buddy: String },

    /// Presence change for one of the user's contacts.
    Presence {
        user: String,
        buddy: String,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    /// Occupant joined or left a chatroom.
    Participant {
        user: String,
        room: String,
        nickname: String,
        online: bool,
    },

    /// vCard response, matched to the request by `request_id`.
    Vcard {
        user: String,
        request_id: u32,
        legacy_name: String,
        full_name: String,
        /// Base64-encoded avatar image, absent when none is known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },

    /// Surface an error to the user.
    Error {
        user: String,
        kind: String,
        message: String,
    },

    /// The user's session reached the connected state.
    Connected { user: String },

    /// The user's session ended.
    Disconnected { user: String, reason: String },
}

impl LinkCommand {
    /// Build an error report for a user.
    pub fn error(user: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        LinkCommand::Error {
            user: user.into(),
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// The gateway user this command concerns.
    pub fn user(&self) -> &str {
        match self {
            LinkCommand::DeliverMessage { user, .. }
            | LinkCommand::RosterAdd { user, .. }
            | LinkCommand::RosterRemove { user, .. }
            | LinkCommand::Presence { user, .. }
            | LinkCommand::Participant { user, .. }
            | LinkCommand::Vcard { user, .. }
            | LinkCommand::Error { user, .. }
            | LinkCommand::Connected { user }
            | LinkCommand::Disconnected { user, .. } => user,
        }
    }
}

// ============================================================================
// Error Kinds
// ============================================================================

/// Well-known error kinds for the Error command.
pub mod error_kinds {
    /// Authentication failed or credentials were revoked.
    pub const AUTH: &str = "auth";
    /// A remote-service call failed (network, rate limit, bad response).
    pub const API: &str = "api";
    /// The persistence layer was unavailable.
    pub const STORAGE: &str = "storage";
    /// Malformed inbound event, rejected at the link boundary.
    pub const PROTOCOL: &str = "protocol";
    /// Unrecognized gateway command in a user message.
    pub const COMMAND: &str = "command";
    /// Action requires a connected session.
    pub const NOT_CONNECTED: &str = "not_connected";
}
