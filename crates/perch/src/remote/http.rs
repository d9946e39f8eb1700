//! HTTP client for the remote microblogging service.
//!
//! Implements the classic REST + OAuth 1.0a surface: the three-legged token
//! dance, home timeline, direct messages, status updates, friendship
//! management and avatar fetches. Wire shapes are private to this module;
//! the rest of the crate only sees the domain types.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::RemoteConfig;

use super::RemoteApi;
use super::error::{ApiError, ApiResult};
use super::sign::{SigningKeys, authorization_header};
use super::types::{
    AccessGrant, Credentials, DirectMessage, RemoteUser, RequestToken, Status,
};

/// Remote client speaking OAuth 1.0a-signed HTTP to a configurable base URL.
pub struct HttpRemoteApi {
    client: Client,
    api_base: String,
    consumer_key: String,
    consumer_secret: String,
}

impl HttpRemoteApi {
    /// Build a client from configuration.
    pub fn new(config: &RemoteConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
        })
    }

    fn keys<'a>(&'a self, credentials: Option<&'a Credentials>) -> SigningKeys<'a> {
        SigningKeys {
            consumer_key: &self.consumer_key,
            consumer_secret: &self.consumer_secret,
            token: credentials.map(|c| c.token.as_str()),
            token_secret: credentials.map(|c| c.secret.as_str()),
        }
    }

    async fn get_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        credentials: &Credentials,
        query: &[(&str, &str)],
    ) -> ApiResult<T> {
        let url = format!("{}{}", self.api_base, path);
        let header = authorization_header("GET", &url, &self.keys(Some(credentials)), &[], query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header("Authorization", header)
            .send()
            .await?;

        decode(response).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        credentials: &Credentials,
        form: &[(&str, &str)],
    ) -> ApiResult<T> {
        let url = format!("{}{}", self.api_base, path);
        let header = authorization_header("POST", &url, &self.keys(Some(credentials)), &[], form);

        let response = self
            .client
            .post(&url)
            .form(form)
            .header("Authorization", header)
            .send()
            .await?;

        decode(response).await
    }

    /// POST to a token endpoint and parse the form-encoded response body.
    async fn post_token_leg(
        &self,
        path: &str,
        keys: SigningKeys<'_>,
        oauth_extra: &[(&str, &str)],
    ) -> ApiResult<HashMap<String, String>> {
        let url = format!("{}{}", self.api_base, path);
        let header = authorization_header("POST", &url, &keys, oauth_extra, &[]);

        let response = self
            .client
            .post(&url)
            .header("Authorization", header)
            .send()
            .await?;

        let body = check_status(response).await?.text().await.map_err(ApiError::from)?;
        Ok(parse_form_body(&body))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn request_token(&self) -> ApiResult<RequestToken> {
        let pairs = self
            .post_token_leg(
                "/oauth/request_token",
                self.keys(None),
                &[("oauth_callback", "oob")],
            )
            .await?;

        let token = form_field(&pairs, "oauth_token")?;
        let secret = form_field(&pairs, "oauth_token_secret")?;
        let authorize_url = format!(
            "{}/oauth/authorize?oauth_token={}",
            self.api_base,
            urlencoding::encode(&token)
        );

        Ok(RequestToken {
            token,
            secret,
            authorize_url,
        })
    }

    async fn exchange_pin(&self, request: &RequestToken, pin: &str) -> ApiResult<AccessGrant> {
        let keys = SigningKeys {
            consumer_key: &self.consumer_key,
            consumer_secret: &self.consumer_secret,
            token: Some(&request.token),
            token_secret: Some(&request.secret),
        };
        let pairs = self
            .post_token_leg("/oauth/access_token", keys, &[("oauth_verifier", pin)])
            .await?;

        let credentials = Credentials {
            token: form_field(&pairs, "oauth_token")?,
            secret: form_field(&pairs, "oauth_token_secret")?,
        };

        Ok(AccessGrant {
            credentials,
            screen_name: pairs.get("screen_name").cloned(),
        })
    }

    async fn verify(&self, credentials: &Credentials) -> ApiResult<RemoteUser> {
        let user: WireUser = self
            .get_signed("/1.1/account/verify_credentials.json", credentials, &[])
            .await?;
        Ok(user.into())
    }

    async fn home_timeline(
        &self,
        credentials: &Credentials,
        since_id: Option<u64>,
    ) -> ApiResult<Vec<Status>> {
        let since;
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(id) = since_id {
            since = id.to_string();
            query.push(("since_id", &since));
        }

        let statuses: Vec<WireStatus> = self
            .get_signed("/1.1/statuses/home_timeline.json", credentials, &query)
            .await?;
        Ok(statuses.into_iter().map(Into::into).collect())
    }

    async fn direct_messages(
        &self,
        credentials: &Credentials,
        since_id: Option<u64>,
    ) -> ApiResult<Vec<DirectMessage>> {
        let since;
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(id) = since_id {
            since = id.to_string();
            query.push(("since_id", &since));
        }

        let messages: Vec<WireDirectMessage> = self
            .get_signed("/1.1/direct_messages.json", credentials, &query)
            .await?;
        Ok(messages.into_iter().map(Into::into).collect())
    }

    async fn post_status(&self, credentials: &Credentials, text: &str) -> ApiResult<Status> {
        let status: WireStatus = self
            .post_form("/1.1/statuses/update.json", credentials, &[("status", text)])
            .await?;
        Ok(status.into())
    }

    async fn send_direct_message(
        &self,
        credentials: &Credentials,
        to: &str,
        text: &str,
    ) -> ApiResult<DirectMessage> {
        let message: WireDirectMessage = self
            .post_form(
                "/1.1/direct_messages/new.json",
                credentials,
                &[("screen_name", to), ("text", text)],
            )
            .await?;
        Ok(message.into())
    }

    async fn follow(&self, credentials: &Credentials, screen_name: &str) -> ApiResult<RemoteUser> {
        let user: WireUser = self
            .post_form(
                "/1.1/friendships/create.json",
                credentials,
                &[("screen_name", screen_name)],
            )
            .await?;
        Ok(user.into())
    }

    async fn unfollow(&self, credentials: &Credentials, screen_name: &str) -> ApiResult<RemoteUser> {
        let user: WireUser = self
            .post_form(
                "/1.1/friendships/destroy.json",
                credentials,
                &[("screen_name", screen_name)],
            )
            .await?;
        Ok(user.into())
    }

    async fn friends(&self, credentials: &Credentials) -> ApiResult<Vec<RemoteUser>> {
        let page: WireFriends = self
            .get_signed("/1.1/friends/list.json", credentials, &[("count", "200")])
            .await?;
        Ok(page.users.into_iter().map(Into::into).collect())
    }

    async fn avatar(&self, url: &str) -> ApiResult<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(ApiError::from)?;
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// Response handling
// ============================================================================

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::Malformed(e.to_string()))
}

async fn check_status(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(match code {
        401 => ApiError::Unauthorized(message),
        420 | 429 => ApiError::RateLimited,
        _ => ApiError::Status { status: code, message },
    })
}

/// Parse a `k=v&k=v` token-endpoint body.
fn parse_form_body(body: &str) -> HashMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let v = urlencoding::decode(v).ok()?;
            Some((k.to_string(), v.into_owned()))
        })
        .collect()
}

fn form_field(pairs: &HashMap<String, String>, key: &str) -> ApiResult<String> {
    pairs
        .get(key)
        .cloned()
        .ok_or_else(|| ApiError::Malformed(format!("token response missing {key}")))
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Deserialize)]
struct WireUser {
    id: u64,
    screen_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile_image_url_https: Option<String>,
    #[serde(default)]
    profile_image_url: Option<String>,
}

impl From<WireUser> for RemoteUser {
    fn from(w: WireUser) -> Self {
        let name = if w.name.is_empty() {
            w.screen_name.clone()
        } else {
            w.name
        };
        RemoteUser {
            id: w.id,
            screen_name: w.screen_name,
            name,
            avatar_url: w.profile_image_url_https.or(w.profile_image_url),
        }
    }
}

#[derive(Deserialize)]
struct WireStatus {
    id: u64,
    text: String,
    user: WireUser,
    #[serde(default)]
    created_at: Option<String>,
}

impl From<WireStatus> for Status {
    fn from(w: WireStatus) -> Self {
        Status {
            id: w.id,
            text: w.text,
            author: w.user.into(),
            created_at: w.created_at,
        }
    }
}

#[derive(Deserialize)]
struct WireDirectMessage {
    id: u64,
    text: String,
    sender: WireUser,
    #[serde(default)]
    created_at: Option<String>,
}

impl From<WireDirectMessage> for DirectMessage {
    fn from(w: WireDirectMessage) -> Self {
        DirectMessage {
            id: w.id,
            text: w.text,
            sender: w.sender.into(),
            created_at: w.created_at,
        }
    }
}

#[derive(Deserialize)]
struct WireFriends {
    users: Vec<WireUser>,
}
