//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! The remote service's API predates OAuth 2: every authenticated call
//! carries an `Authorization: OAuth ...` header with an HMAC-SHA1 signature
//! over the request method, URL and parameters (RFC 5849).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Key material for signing one request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SigningKeys<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
    /// Token and token secret; absent for the request-token leg.
    pub token: Option<&'a str>,
    pub token_secret: Option<&'a str>,
}

/// Build a complete OAuth Authorization header value for one request.
///
/// `oauth_extra` carries leg-specific protocol parameters (callback,
/// verifier); `request_params` carries the query or form parameters that
/// take part in the signature but stay out of the header.
pub(crate) fn authorization_header(
    method: &str,
    url: &str,
    keys: &SigningKeys<'_>,
    oauth_extra: &[(&str, &str)],
    request_params: &[(&str, &str)],
) -> String {
    let nonce = nonce();
    let timestamp = unix_timestamp().to_string();
    header_with(method, url, keys, oauth_extra, request_params, &nonce, &timestamp)
}

fn header_with(
    method: &str,
    url: &str,
    keys: &SigningKeys<'_>,
    oauth_extra: &[(&str, &str)],
    request_params: &[(&str, &str)],
    nonce: &str,
    timestamp: &str,
) -> String {
    let mut oauth_params: Vec<(String, String)> = vec![
        ("oauth_consumer_key".to_string(), keys.consumer_key.to_string()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), timestamp.to_string()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];
    if let Some(token) = keys.token {
        oauth_params.push(("oauth_token".to_string(), token.to_string()));
    }
    for (k, v) in oauth_extra {
        oauth_params.push((k.to_string(), v.to_string()));
    }

    let mut all = oauth_params.clone();
    for (k, v) in request_params {
        all.push((k.to_string(), v.to_string()));
    }

    let signature = signature(
        method,
        url,
        &all,
        keys.consumer_secret,
        keys.token_secret.unwrap_or(""),
    );
    oauth_params.push(("oauth_signature".to_string(), signature));

    let fields: Vec<String> = oauth_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect();
    format!("OAuth {}", fields.join(", "))
}

/// HMAC-SHA1 signature over the RFC 5849 signature base string.
fn signature(
    method: &str,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    token_secret: &str,
) -> String {
    // Parameters are percent-encoded first, then sorted by encoded name and
    // value. Sorting the encoded pairs gives both orderings at once.
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let base = format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    );
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    );

    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(base.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// RFC 3986 percent encoding with the unreserved set OAuth requires.
fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
