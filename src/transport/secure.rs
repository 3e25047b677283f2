//! Secure-store credential transport for mobile clients.
//!
//! The refresh credential is the only long-lived secret, so it alone goes to
//! the platform secure store (OS keychain). The access credential and its
//! expiry are short-lived and reconstructable via refresh, so they live in a
//! faster, less durable store. Outgoing requests carry the access credential
//! as a bearer header; the backend still issues credentials as cookies, so
//! extraction is shared with the cookie variant.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::session::Session;
use crate::storage::KeyValueStore;

use super::{
    cookie::extract_from_headers, CredentialTransport, ExtractedCredentials, RequestCredentials,
    ACCESS_CREDENTIAL_COOKIE, ACCESS_EXPIRY_COOKIE, REFRESH_CREDENTIAL_COOKIE,
};

pub struct SecureStoreTransport {
    /// Fast store for the short-lived access credential and expiry.
    fast: Arc<dyn KeyValueStore>,
    /// Secure store for the long-lived refresh credential.
    secure: Arc<dyn KeyValueStore>,
}

impl SecureStoreTransport {
    pub fn new(fast: Arc<dyn KeyValueStore>, secure: Arc<dyn KeyValueStore>) -> Self {
        Self { fast, secure }
    }
}

#[async_trait]
impl CredentialTransport for SecureStoreTransport {
    fn extract_credentials(&self, headers: &HeaderMap) -> ExtractedCredentials {
        extract_from_headers(headers)
    }

    async fn request_credentials(
        &self,
        session: &Session,
        include_refresh: bool,
    ) -> Result<RequestCredentials> {
        // The refresh endpoint reads the refresh credential from a cookie
        // regardless of client platform; everything else is a bearer header.
        let cookie = if include_refresh {
            self.load_refresh_credential()
                .await?
                .map(|refresh| format!("{REFRESH_CREDENTIAL_COOKIE}={refresh}"))
        } else {
            None
        };
        Ok(RequestCredentials {
            cookie,
            bearer: session.access_credential.clone(),
        })
    }

    async fn load_access_credential(&self) -> Result<Option<String>> {
        self.fast.get(ACCESS_CREDENTIAL_COOKIE).await
    }

    async fn store_access_credential(&self, value: &str) -> Result<()> {
        self.fast.set(ACCESS_CREDENTIAL_COOKIE, value).await
    }

    async fn delete_access_credential(&self) -> Result<()> {
        self.fast.delete(ACCESS_CREDENTIAL_COOKIE).await
    }

    async fn load_access_expiry(&self) -> Result<Option<i64>> {
        let raw = self.fast.get(ACCESS_EXPIRY_COOKIE).await?;
        Ok(super::parse_stored_expiry(raw))
    }

    async fn store_access_expiry(&self, value: i64) -> Result<()> {
        self.fast.set(ACCESS_EXPIRY_COOKIE, &value.to_string()).await
    }

    async fn delete_access_expiry(&self) -> Result<()> {
        self.fast.delete(ACCESS_EXPIRY_COOKIE).await
    }

    async fn load_refresh_credential(&self) -> Result<Option<String>> {
        self.secure.get(REFRESH_CREDENTIAL_COOKIE).await
    }

    async fn persist_refresh_credential(&self, value: &str) -> Result<()> {
        self.secure.set(REFRESH_CREDENTIAL_COOKIE, value).await
    }

    async fn delete_refresh_credential(&self) -> Result<()> {
        self.secure.delete(REFRESH_CREDENTIAL_COOKIE).await
    }
}
