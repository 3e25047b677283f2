//! Cookie-based credential transport and the set-cookie parser.
//!
//! Per RFC 6265 each `Set-Cookie` header carries exactly one cookie, and
//! well-behaved HTTP layers expose them as separate header values. Some
//! constrained platforms instead collapse every cookie into one header value
//! joined by `", "` — a delimiter that also appears inside attribute values
//! like `Expires` — so a cookie can surface as an attribute-looking key such
//! as `"secure, refresh_token"` glued onto the previous cookie. The parser
//! models that shape explicitly as a tagged variant and lookup unwraps it
//! before trusting any value.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, SET_COOKIE};
use std::sync::Arc;
use tracing::debug;

use crate::session::Session;
use crate::storage::KeyValueStore;

use super::{
    CredentialTransport, ExtractedCredentials, RequestCredentials, ACCESS_CREDENTIAL_COOKIE,
    ACCESS_EXPIRY_COOKIE, REFRESH_CREDENTIAL_COOKIE,
};

/// One parsed cookie from a `Set-Cookie` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCookie {
    /// A plain `name=value` cookie.
    Simple(String),
    /// A cookie whose attribute list swallowed one or more following cookies
    /// when the platform collapsed multiple `Set-Cookie` values into one
    /// header. `inner` maps the raw observed keys (e.g.
    /// `"secure, refresh_token"`) to their values.
    PlatformQuirkWrapped {
        value: String,
        inner: HashMap<String, String>,
    },
}

impl ParsedCookie {
    pub fn value(&self) -> &str {
        match self {
            ParsedCookie::Simple(value) => value,
            ParsedCookie::PlatformQuirkWrapped { value, .. } => value,
        }
    }

    /// Looks up a cookie that was collapsed into this cookie's attribute
    /// list. The raw key keeps the attribute prefix, so match on the segment
    /// after the last comma.
    pub fn collapsed(&self, name: &str) -> Option<&str> {
        match self {
            ParsedCookie::Simple(_) => None,
            ParsedCookie::PlatformQuirkWrapped { inner, .. } => inner
                .iter()
                .find(|(key, _)| key.rsplit(',').next().map(str::trim) == Some(name))
                .map(|(_, value)| value.as_str()),
        }
    }
}

/// Parses one `Set-Cookie` header value. Returns `None` for text with no
/// leading `name=value` pair.
pub fn parse_set_cookie(header: &str) -> Option<(String, ParsedCookie)> {
    let mut fields = header.split(';');
    let (name, value) = fields.next()?.split_once('=')?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() {
        return None;
    }

    let mut inner = HashMap::new();
    for field in fields {
        let Some((key, val)) = field.split_once('=') else {
            // Bare attributes like HttpOnly and Secure.
            continue;
        };
        let key = key.trim();
        let val = val.trim();
        if key.contains(',') {
            // Collapsed shape: a bare attribute plus the next cookie's name,
            // e.g. "secure, refresh_token".
            inner.insert(key.to_string(), val.to_string());
        } else if let Some((tail_name, tail_value)) = split_collapsed_value(val) {
            // Collapsed shape where a valued attribute swallowed the next
            // cookie, e.g. Path "/, refresh_token=R".
            inner.insert(format!("{key}, {tail_name}"), tail_value.to_string());
        }
    }

    let cookie = if inner.is_empty() {
        ParsedCookie::Simple(value.to_string())
    } else {
        ParsedCookie::PlatformQuirkWrapped {
            value: value.to_string(),
            inner,
        }
    };
    Some((name.to_string(), cookie))
}

/// Detects a `", name=value"` tail inside an attribute value. The candidate
/// name must look like a cookie token; this keeps date attributes such as
/// `Expires=Wed, 21 Oct 2026 07:28:00 GMT` from being misread.
fn split_collapsed_value(value: &str) -> Option<(&str, &str)> {
    let (_, tail) = value.rsplit_once(", ")?;
    let (name, rest) = tail.split_once('=')?;
    let is_token = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if is_token {
        Some((name, rest))
    } else {
        None
    }
}

/// Collects credentials from every `Set-Cookie` value in a response,
/// unwrapping collapsed cookies. Shared by both transport variants since the
/// backend always issues credentials as cookies.
pub(crate) fn extract_from_headers(headers: &HeaderMap) -> ExtractedCredentials {
    let mut cookies: HashMap<String, ParsedCookie> = HashMap::new();
    for value in headers.get_all(SET_COOKIE) {
        let Ok(text) = value.to_str() else {
            debug!("Skipping non-UTF-8 set-cookie header");
            continue;
        };
        if let Some((name, cookie)) = parse_set_cookie(text) {
            cookies.insert(name, cookie);
        }
    }

    let access_expiry = lookup(&cookies, ACCESS_EXPIRY_COOKIE).and_then(|raw| match raw.parse() {
        Ok(expiry) => Some(expiry),
        Err(_) => {
            debug!(value = %raw, "Unparseable access expiry cookie");
            None
        }
    });

    ExtractedCredentials {
        access_credential: lookup(&cookies, ACCESS_CREDENTIAL_COOKIE),
        access_expiry,
        refresh_credential: lookup(&cookies, REFRESH_CREDENTIAL_COOKIE),
    }
}

fn lookup(cookies: &HashMap<String, ParsedCookie>, name: &str) -> Option<String> {
    if let Some(cookie) = cookies.get(name) {
        return Some(cookie.value().to_string());
    }
    cookies
        .values()
        .find_map(|cookie| cookie.collapsed(name).map(str::to_string))
}

/// Transport for browser-hosted clients: credentials travel as cookie
/// headers and rest in a single origin-scoped store.
pub struct CookieTransport {
    store: Arc<dyn KeyValueStore>,
}

impl CookieTransport {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialTransport for CookieTransport {
    fn extract_credentials(&self, headers: &HeaderMap) -> ExtractedCredentials {
        extract_from_headers(headers)
    }

    async fn request_credentials(
        &self,
        session: &Session,
        include_refresh: bool,
    ) -> Result<RequestCredentials> {
        let mut pairs = Vec::new();
        if include_refresh {
            if let Some(refresh) = self.load_refresh_credential().await? {
                pairs.push(format!("{REFRESH_CREDENTIAL_COOKIE}={refresh}"));
            }
        }
        if let Some(access) = &session.access_credential {
            pairs.push(format!("{ACCESS_CREDENTIAL_COOKIE}={access}"));
        }
        Ok(RequestCredentials {
            cookie: (!pairs.is_empty()).then(|| pairs.join("; ")),
            bearer: None,
        })
    }

    async fn load_access_credential(&self) -> Result<Option<String>> {
        self.store.get(ACCESS_CREDENTIAL_COOKIE).await
    }

    async fn store_access_credential(&self, value: &str) -> Result<()> {
        self.store.set(ACCESS_CREDENTIAL_COOKIE, value).await
    }

    async fn delete_access_credential(&self) -> Result<()> {
        self.store.delete(ACCESS_CREDENTIAL_COOKIE).await
    }

    async fn load_access_expiry(&self) -> Result<Option<i64>> {
        let raw = self.store.get(ACCESS_EXPIRY_COOKIE).await?;
        Ok(super::parse_stored_expiry(raw))
    }

    async fn store_access_expiry(&self, value: i64) -> Result<()> {
        self.store.set(ACCESS_EXPIRY_COOKIE, &value.to_string()).await
    }

    async fn delete_access_expiry(&self) -> Result<()> {
        self.store.delete(ACCESS_EXPIRY_COOKIE).await
    }

    async fn load_refresh_credential(&self) -> Result<Option<String>> {
        self.store.get(REFRESH_CREDENTIAL_COOKIE).await
    }

    async fn persist_refresh_credential(&self, value: &str) -> Result<()> {
        self.store.set(REFRESH_CREDENTIAL_COOKIE, value).await
    }

    async fn delete_refresh_credential(&self) -> Result<()> {
        self.store.delete(REFRESH_CREDENTIAL_COOKIE).await
    }
}
