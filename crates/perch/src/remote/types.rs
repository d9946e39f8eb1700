//! Domain types for the remote microblogging service.

use serde::{Deserialize, Serialize};

/// A remote-service account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: u64,
    pub screen_name: String,
    /// Full display name; equals the screen name when the service returns
    /// none.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// One entry on the user's home timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: u64,
    pub text: String,
    pub author: RemoteUser,
    /// Raw service timestamp, passed through to the transport untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// One direct message addressed to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: u64,
    pub text: String,
    pub sender: RemoteUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Temporary token from the first OAuth leg, held while the user fetches
/// their PIN from the authorization page.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestToken {
    pub token: String,
    pub secret: String,
    pub authorize_url: String,
}

/// Access token/secret pair bound to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub secret: String,
}

/// Result of a successful PIN exchange.
///
/// The service reports the account's screen name alongside the credentials;
/// some deployments omit it, in which case a follow-up verify call fills
/// the profile in.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrant {
    pub credentials: Credentials,
    pub screen_name: Option<String>,
}
