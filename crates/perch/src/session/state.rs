//! Connection lifecycle and display-mode types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of one user's connection to the remote service.
///
/// `Disconnected` is terminal for a session instance; a later login creates
/// a fresh session starting at `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registry entry exists, no credentials yet.
    New,
    /// Request token obtained, waiting for the user to supply a PIN.
    AwaitingPin,
    /// Access token validated; polling is active.
    Connected,
    /// Terminal. The registry entry is removed on entry to this state.
    Disconnected,
}

impl ConnectionState {
    /// Validate a lifecycle move.
    ///
    /// An illegal move is a programming defect and is rejected rather than
    /// silently applied.
    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState, StateError> {
        use ConnectionState::*;

        let legal = matches!(
            (self, to),
            (New, AwaitingPin)
                | (New, Connected)
                | (New, Disconnected)
                | (AwaitingPin, Connected)
                | (AwaitingPin, Disconnected)
                | (Connected, Disconnected)
        );

        if legal {
            Ok(to)
        } else {
            Err(StateError::IllegalTransition { from: self, to })
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    fn label(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::AwaitingPin => "awaiting_pin",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors from connection-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("illegal connection-state transition {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// How remote contacts and content map onto the messaging network's
/// contact/room model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// All remote content funnels through one synthetic contact; authors
    /// are attributed inline.
    SingleContact,
    /// Every followed account becomes an individual contact.
    MultiContact,
    /// Followed accounts' content is delivered into one shared room.
    Chatroom,
}

impl DisplayMode {
    /// Parse a user-facing mode name, as typed in a `#mode` command.
    pub fn parse(s: &str) -> Option<DisplayMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single_contact" => Some(DisplayMode::SingleContact),
            "multi" | "multi_contact" => Some(DisplayMode::MultiContact),
            "chatroom" | "room" => Some(DisplayMode::Chatroom),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DisplayMode::SingleContact => "single",
            DisplayMode::MultiContact => "multi",
            DisplayMode::Chatroom => "chatroom",
        }
    }
}

impl Default for DisplayMode {
    fn default() -> Self {
        DisplayMode::SingleContact
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which poll pipeline an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    Status,
    DirectMessage,
}

impl CursorKind {
    pub const ALL: [CursorKind; 2] = [CursorKind::Status, CursorKind::DirectMessage];

    /// Stable index for per-session bookkeeping arrays.
    pub fn index(self) -> usize {
        match self {
            CursorKind::Status => 0,
            CursorKind::DirectMessage => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CursorKind::Status => "status",
            CursorKind::DirectMessage => "direct_message",
        }
    }
}

impl fmt::Display for CursorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
