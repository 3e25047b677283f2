//! Credential transport adapters.
//!
//! A transport decides where credentials travel and where they rest:
//! - `CookieTransport`: credentials ride request/response cookie headers
//!   (browser-hosted clients).
//! - `SecureStoreTransport`: access credential travels as a bearer header and
//!   the refresh credential lives in a platform secure store (mobile clients).
//!
//! Both variants normalize retrieval and storage behind one interface so the
//! session store and pipelines never touch a durable store directly.

pub mod cookie;
pub mod secure;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};

use crate::error::AuthError;
use crate::session::Session;

pub use cookie::{CookieTransport, ParsedCookie};
pub use secure::SecureStoreTransport;

/// Cookie names used by the backend; they double as durable-store keys.
pub const ACCESS_CREDENTIAL_COOKIE: &str = "access_token";
pub const REFRESH_CREDENTIAL_COOKIE: &str = "refresh_token";
pub const ACCESS_EXPIRY_COOKIE: &str = "access_token_expiration";

/// Credentials pulled out of a response. Any field may be absent; malformed
/// transport data degrades to absence rather than an error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractedCredentials {
    pub access_credential: Option<String>,
    /// Seconds since epoch.
    pub access_expiry: Option<i64>,
    pub refresh_credential: Option<String>,
}

/// Transport-specific representation of credentials on an outgoing request.
#[derive(Debug, Default, Clone)]
pub struct RequestCredentials {
    pub cookie: Option<String>,
    pub bearer: Option<String>,
}

impl RequestCredentials {
    pub fn is_empty(&self) -> bool {
        self.cookie.is_none() && self.bearer.is_none()
    }

    /// Applies the credentials to a header map. An existing `Cookie` header
    /// is merged with, never replaced; an existing `Authorization` header is
    /// left untouched.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        if let Some(cookie) = &self.cookie {
            let merged = match headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}; {cookie}"),
                None => cookie.clone(),
            };
            headers.insert(COOKIE, HeaderValue::from_str(&merged)?);
        }
        if let Some(bearer) = &self.bearer {
            if !headers.contains_key(AUTHORIZATION) {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {bearer}"))?,
                );
            }
        }
        Ok(())
    }
}

/// Decodes a persisted expiry value. Unparseable text degrades to absence,
/// matching the "malformed transport data is no credential" policy.
pub(crate) fn parse_stored_expiry(raw: Option<String>) -> Option<i64> {
    raw.and_then(|text| match text.parse() {
        Ok(expiry) => Some(expiry),
        Err(_) => {
            tracing::debug!(value = %text, "Unparseable persisted access expiry");
            None
        }
    })
}

#[async_trait]
pub trait CredentialTransport: Send + Sync {
    /// Pulls credentials out of response headers. Infallible: anything
    /// unparseable is treated as "no credential found".
    fn extract_credentials(&self, headers: &HeaderMap) -> ExtractedCredentials;

    /// Builds the credential representation for an outgoing request.
    /// `include_refresh` is set only for the refresh and logout endpoints.
    async fn request_credentials(
        &self,
        session: &Session,
        include_refresh: bool,
    ) -> Result<RequestCredentials>;

    async fn load_access_credential(&self) -> Result<Option<String>>;
    async fn store_access_credential(&self, value: &str) -> Result<()>;
    async fn delete_access_credential(&self) -> Result<()>;

    /// Expiry is stored as seconds since epoch; an unparseable persisted
    /// value reads back as absent.
    async fn load_access_expiry(&self) -> Result<Option<i64>>;
    async fn store_access_expiry(&self, value: i64) -> Result<()>;
    async fn delete_access_expiry(&self) -> Result<()>;

    async fn load_refresh_credential(&self) -> Result<Option<String>>;
    async fn persist_refresh_credential(&self, value: &str) -> Result<()>;
    async fn delete_refresh_credential(&self) -> Result<()>;
}
