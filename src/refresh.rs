//! Refresh coordinator and the backend exchange seam.
//!
//! The coordinator serializes every refresh trigger through one in-flight
//! shared future. The first trigger installs the future; every concurrent
//! trigger clones it and awaits the same outcome, so N requests that all
//! observe a stale session produce exactly one backend call. A boolean
//! "already refreshing" flag cannot do this: it skips late arrivals without
//! delivering them the result, and with a backend that rotates refresh
//! credentials on every call a second concurrent exchange would burn an
//! already-invalidated credential and spuriously log the user out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use reqwest::header::COOKIE;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::session::SessionStore;
use crate::transport::{CredentialTransport, REFRESH_CREDENTIAL_COOKIE};

/// Outcome of a refresh cycle. `Clone` because one resolved value is shared
/// by every waiter attached to the in-flight future.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh rejected by backend (status {status})")]
    Rejected { status: u16 },

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Refresh request timed out")]
    TimedOut,

    #[error("No refresh credential available")]
    NoRefreshCredential,

    #[error("Refresh response carried no access credential")]
    MissingCredentials,

    #[error("Credential storage error: {0}")]
    Storage(String),
}

/// Credentials issued by a successful exchange. The backend may omit the
/// expiry and may or may not rotate the refresh credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub access_credential: String,
    pub access_expiry: Option<i64>,
    pub refresh_credential: Option<String>,
}

/// Seam between the coordinator and the authentication backend. Tests swap
/// in counting mocks; production uses [`HttpRefreshBackend`].
#[async_trait]
pub trait RefreshBackend: Send + Sync {
    async fn exchange(
        &self,
        refresh_credential: Option<&str>,
    ) -> Result<IssuedCredentials, RefreshError>;
}

/// Exchanges the refresh credential over HTTP. The call goes straight
/// through the shared `reqwest::Client`, not through the middleware
/// pipelines, so it can never re-trigger itself.
pub struct HttpRefreshBackend {
    http: Client,
    config: Config,
    transport: Arc<dyn CredentialTransport>,
}

#[derive(Debug, Deserialize)]
struct CredentialBody {
    access_token: Option<String>,
}

impl HttpRefreshBackend {
    pub fn new(http: Client, config: Config, transport: Arc<dyn CredentialTransport>) -> Self {
        Self {
            http,
            config,
            transport,
        }
    }
}

#[async_trait]
impl RefreshBackend for HttpRefreshBackend {
    async fn exchange(
        &self,
        refresh_credential: Option<&str>,
    ) -> Result<IssuedCredentials, RefreshError> {
        let refresh = refresh_credential.ok_or(RefreshError::NoRefreshCredential)?;

        let url = self.config.endpoint(&self.config.refresh_path);
        let response = self
            .http
            .post(&url)
            .header(COOKIE, format!("{REFRESH_CREDENTIAL_COOKIE}={refresh}"))
            .send()
            .await
            .map_err(|err| RefreshError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let extracted = self.transport.extract_credentials(response.headers());
        let access_credential = match extracted.access_credential {
            Some(access) => access,
            // Some backend responses carry the access token only in the
            // JSON body.
            None => response
                .json::<CredentialBody>()
                .await
                .ok()
                .and_then(|body| body.access_token)
                .ok_or(RefreshError::MissingCredentials)?,
        };

        Ok(IssuedCredentials {
            access_credential,
            access_expiry: extracted.access_expiry,
            refresh_credential: extracted.refresh_credential,
        })
    }
}

type RefreshOutcome = Result<(), RefreshError>;
type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Serializes refresh attempts. States: `Idle` (empty slot), `Refreshing`
/// (slot holds the shared in-flight future), and a transient `Failed` that
/// clears the session before returning to `Idle` so a subsequent login
/// starts clean.
pub struct RefreshCoordinator {
    session: Arc<SessionStore>,
    backend: Arc<dyn RefreshBackend>,
    timeout: Duration,
    default_access_ttl: i64,
    in_flight: Mutex<Option<InFlight>>,
}

impl RefreshCoordinator {
    pub fn new(session: Arc<SessionStore>, backend: Arc<dyn RefreshBackend>, config: &Config) -> Self {
        Self {
            session,
            backend,
            timeout: config.refresh_timeout(),
            default_access_ttl: config.default_access_ttl_secs,
            in_flight: Mutex::new(None),
        }
    }

    /// Ensures one refresh cycle runs and returns its outcome. Concurrent
    /// callers attach to the in-flight operation instead of starting their
    /// own backend call.
    pub async fn refresh(&self) -> RefreshOutcome {
        let operation = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(operation) => operation.clone(),
                None => {
                    let operation = Self::run(
                        self.session.clone(),
                        self.backend.clone(),
                        self.timeout,
                        self.default_access_ttl,
                    )
                    .boxed()
                    .shared();
                    *slot = Some(operation.clone());
                    operation
                }
            }
        };

        let outcome = operation.clone().await;

        // Back to Idle. Only the operation we awaited is removed; a newer
        // cycle installed in the meantime stays in place.
        {
            let mut slot = self.in_flight.lock();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&operation)) {
                *slot = None;
            }
        }

        outcome
    }

    /// One refresh cycle. `'static` so it can live in the shared slot; the
    /// lock is never held across any of its awaits.
    async fn run(
        session: Arc<SessionStore>,
        backend: Arc<dyn RefreshBackend>,
        timeout: Duration,
        default_access_ttl: i64,
    ) -> RefreshOutcome {
        debug!("Refreshing access credential");

        let refresh_credential = match session.refresh_credential().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "Failed to read refresh credential");
                session.clear().await;
                return Err(RefreshError::Storage(err.to_string()));
            }
        };

        // A hung exchange would block every request waiting on this cycle,
        // so timeout is treated identically to failure.
        let exchanged = match tokio::time::timeout(
            timeout,
            backend.exchange(refresh_credential.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshError::TimedOut),
        };

        match exchanged {
            Ok(issued) => {
                if let Some(rotated) = &issued.refresh_credential {
                    if let Err(err) = session.set_refresh_credential(rotated).await {
                        warn!(error = %err, "Failed to persist rotated refresh credential");
                    }
                }
                let expiry = issued
                    .access_expiry
                    .unwrap_or_else(|| Utc::now().timestamp() + default_access_ttl);
                session.set_access_credential(&issued.access_credential, expiry).await;
                debug!(expiry, "Access credential refreshed");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Refresh failed; clearing session");
                session.clear().await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::CookieTransport;

    #[tokio::test]
    async fn test_http_backend_requires_refresh_credential() {
        // No credential means no network call at all.
        let transport = Arc::new(CookieTransport::new(Arc::new(MemoryStore::new())));
        let backend = HttpRefreshBackend::new(
            Client::new(),
            Config::new("https://api.example.test"),
            transport,
        );

        let outcome = backend.exchange(None).await;
        assert_eq!(outcome, Err(RefreshError::NoRefreshCredential));
    }
}
