//! Remote microblogging service client.
//!
//! The session engine talks to the remote service exclusively through the
//! [`RemoteApi`] trait; [`HttpRemoteApi`] is the shipped implementation.
//! Once a user completes authentication the engine wraps the client and the
//! user's credentials in a [`RemoteHandle`], which worker-pool tasks clone
//! for the duration of one call.

mod error;
mod http;
mod sign;
mod types;

pub use error::{ApiError, ApiResult};
pub use http::HttpRemoteApi;
pub use types::{AccessGrant, Credentials, DirectMessage, RemoteUser, RequestToken, Status};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Operations the session engine needs from the remote service.
///
/// Every method is a blocking network operation from the engine's point of
/// view; the engine only ever invokes them from worker-pool tasks.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// First OAuth leg: obtain a temporary token and the authorization URL
    /// the user must visit to fetch their PIN.
    async fn request_token(&self) -> ApiResult<RequestToken>;

    /// Third OAuth leg: exchange the user-supplied PIN for access
    /// credentials.
    async fn exchange_pin(&self, request: &RequestToken, pin: &str) -> ApiResult<AccessGrant>;

    /// Validate credentials and return the account they belong to.
    async fn verify(&self, credentials: &Credentials) -> ApiResult<RemoteUser>;

    /// Statuses on the user's home timeline newer than `since_id`.
    async fn home_timeline(
        &self,
        credentials: &Credentials,
        since_id: Option<u64>,
    ) -> ApiResult<Vec<Status>>;

    /// Direct messages newer than `since_id`.
    async fn direct_messages(
        &self,
        credentials: &Credentials,
        since_id: Option<u64>,
    ) -> ApiResult<Vec<DirectMessage>>;

    /// Post a new status.
    async fn post_status(&self, credentials: &Credentials, text: &str) -> ApiResult<Status>;

    /// Send a direct message to another account.
    async fn send_direct_message(
        &self,
        credentials: &Credentials,
        to: &str,
        text: &str,
    ) -> ApiResult<DirectMessage>;

    /// Start following an account.
    async fn follow(&self, credentials: &Credentials, screen_name: &str) -> ApiResult<RemoteUser>;

    /// Stop following an account.
    async fn unfollow(&self, credentials: &Credentials, screen_name: &str)
    -> ApiResult<RemoteUser>;

    /// Accounts the user currently follows.
    async fn friends(&self, credentials: &Credentials) -> ApiResult<Vec<RemoteUser>>;

    /// Fetch an avatar image by absolute URL. No authentication required.
    async fn avatar(&self, url: &str) -> ApiResult<Vec<u8>>;
}

/// Authenticated client context bound to one user's credentials.
///
/// Cheap to clone: worker-pool tasks take a clone, so tearing a session
/// down never invalidates a call already in flight.
#[derive(Clone)]
pub struct RemoteHandle {
    api: Arc<dyn RemoteApi>,
    credentials: Credentials,
}

impl RemoteHandle {
    pub fn new(api: Arc<dyn RemoteApi>, credentials: Credentials) -> Self {
        Self { api, credentials }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub async fn verify(&self) -> ApiResult<RemoteUser> {
        self.api.verify(&self.credentials).await
    }

    pub async fn home_timeline(&self, since_id: Option<u64>) -> ApiResult<Vec<Status>> {
        self.api.home_timeline(&self.credentials, since_id).await
    }

    pub async fn direct_messages(&self, since_id: Option<u64>) -> ApiResult<Vec<DirectMessage>> {
        self.api.direct_messages(&self.credentials, since_id).await
    }

    pub async fn post_status(&self, text: &str) -> ApiResult<Status> {
        self.api.post_status(&self.credentials, text).await
    }

    pub async fn send_direct_message(&self, to: &str, text: &str) -> ApiResult<DirectMessage> {
        self.api.send_direct_message(&self.credentials, to, text).await
    }

    pub async fn follow(&self, screen_name: &str) -> ApiResult<RemoteUser> {
        self.api.follow(&self.credentials, screen_name).await
    }

    pub async fn unfollow(&self, screen_name: &str) -> ApiResult<RemoteUser> {
        self.api.unfollow(&self.credentials, screen_name).await
    }

    pub async fn friends(&self) -> ApiResult<Vec<RemoteUser>> {
        self.api.friends(&self.credentials).await
    }

    pub async fn avatar(&self, url: &str) -> ApiResult<Vec<u8>> {
        self.api.avatar(url).await
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of logs.
        f.debug_struct("RemoteHandle").finish_non_exhaustive()
    }
}
