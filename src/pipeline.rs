//! Request/response middleware pipelines.
//!
//! The client runs an ordered list of transforms at each boundary instead of
//! an implicit interception chain, which makes ordering and suspension
//! points explicit. Two middlewares implement the coordinator's triggers:
//! `CredentialInjector` on the way out (proactive, advisory) and
//! `AuthRejectionWatch` on the way back (reactive, the correctness
//! backstop). Both keep their trigger decision in a pure function so the
//! edge cases are testable without HTTP machinery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AuthError;
use crate::refresh::RefreshCoordinator;
use crate::session::{Session, SessionStore};
use crate::transport::CredentialTransport;

#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Request, AuthError>;
}

#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    async fn handle(&self, response: Response) -> Result<Response, AuthError>;
}

/// Proactive trigger: refresh before a request leaves when the stored access
/// credential cannot be trusted. Never fires before hydration, and never for
/// a session with no refresh credential to spend.
pub fn wants_refresh(session: &Session, has_refresh_credential: bool, now: i64) -> bool {
    session.hydrated && has_refresh_credential && session.is_stale_at(now)
}

/// Reactive trigger: the backend rejected the credential we sent. 422 is
/// included because the backend overloads it for expired-session cases.
pub fn should_trigger_refresh(status: StatusCode, excluded_path: bool, session: &Session) -> bool {
    let rejection =
        status == StatusCode::UNAUTHORIZED || status == StatusCode::UNPROCESSABLE_ENTITY;
    rejection && !excluded_path && session.hydrated && session.is_authenticated()
}

/// Injects credentials into every outgoing request, refreshing first when
/// they are stale. Excluded paths (the refresh and logout endpoints) skip
/// the refresh gate entirely and instead carry the refresh credential.
pub struct CredentialInjector {
    session: Arc<SessionStore>,
    transport: Arc<dyn CredentialTransport>,
    coordinator: Arc<RefreshCoordinator>,
    config: Config,
}

impl CredentialInjector {
    pub fn new(
        session: Arc<SessionStore>,
        transport: Arc<dyn CredentialTransport>,
        coordinator: Arc<RefreshCoordinator>,
        config: Config,
    ) -> Self {
        Self {
            session,
            transport,
            coordinator,
            config,
        }
    }

    async fn inject(&self, request: &mut Request, include_refresh: bool) -> Result<(), AuthError> {
        let session = self.session.get();
        let credentials = self
            .transport
            .request_credentials(&session, include_refresh)
            .await
            .map_err(|err| AuthError::Storage(err.to_string()))?;
        credentials.apply(request.headers_mut())
    }
}

#[async_trait]
impl RequestMiddleware for CredentialInjector {
    async fn handle(&self, mut request: Request) -> Result<Request, AuthError> {
        let path = request.url().path().to_string();

        if self.config.is_excluded(&path) {
            let include_refresh = self.config.includes_refresh_credential(&path);
            self.inject(&mut request, include_refresh).await?;
            return Ok(request);
        }

        let session = self.session.get();
        let now = Utc::now().timestamp();

        // The refresh credential lives in durable storage, so only read it
        // once the snapshot already looks stale.
        if session.hydrated && session.is_stale_at(now) {
            let has_refresh = match self.session.refresh_credential().await {
                Ok(credential) => credential.is_some(),
                Err(err) => {
                    warn!(error = %err, "Failed to read refresh credential; skipping proactive refresh");
                    false
                }
            };

            if wants_refresh(&session, has_refresh, now) {
                debug!(%path, "Access credential stale; refreshing before request");
                if let Err(err) = self.coordinator.refresh().await {
                    // Advisory only. The request proceeds, possibly
                    // unauthenticated, and the response side handles the rest.
                    warn!(error = %err, %path, "Proactive refresh failed");
                }
            }
        }

        self.inject(&mut request, false).await?;
        Ok(request)
    }
}

/// Watches inbound responses for authentication rejections and invokes the
/// coordinator reactively. The triggering response is returned to the caller
/// unmodified; the original request is not retried here.
pub struct AuthRejectionWatch {
    session: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    config: Config,
}

impl AuthRejectionWatch {
    pub fn new(
        session: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
        config: Config,
    ) -> Self {
        Self {
            session,
            coordinator,
            config,
        }
    }
}

#[async_trait]
impl ResponseMiddleware for AuthRejectionWatch {
    async fn handle(&self, response: Response) -> Result<Response, AuthError> {
        let path = response.url().path().to_string();
        let session = self.session.get();

        if should_trigger_refresh(response.status(), self.config.is_excluded(&path), &session) {
            debug!(status = %response.status(), %path, "Authentication rejection; attempting refresh");
            if let Err(err) = self.coordinator.refresh().await {
                // The coordinator has already cleared the session.
                warn!(error = %err, "Reactive refresh failed; session cleared");
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticated_session(expiry: i64) -> Session {
        Session {
            access_credential: Some("abc".to_string()),
            access_expiry: Some(expiry),
            hydrated: true,
        }
    }

    #[test]
    fn test_wants_refresh_on_past_expiry() {
        let now = 1700000000;
        assert!(wants_refresh(&authenticated_session(now - 1), true, now));
        assert!(!wants_refresh(&authenticated_session(now + 300), true, now));
    }

    #[test]
    fn test_wants_refresh_on_absent_credential() {
        let now = 1700000000;
        let session = Session {
            access_credential: None,
            access_expiry: None,
            hydrated: true,
        };
        assert!(wants_refresh(&session, true, now));
    }

    #[test]
    fn test_no_refresh_without_refresh_credential() {
        let now = 1700000000;
        assert!(!wants_refresh(&authenticated_session(now - 1), false, now));
    }

    #[test]
    fn test_no_refresh_before_hydration() {
        let now = 1700000000;
        let mut session = authenticated_session(now - 1);
        session.hydrated = false;
        assert!(!wants_refresh(&session, true, now));
    }

    #[test]
    fn test_reactive_trigger_on_401_and_422() {
        let session = authenticated_session(1700003600);
        assert!(should_trigger_refresh(
            StatusCode::UNAUTHORIZED,
            false,
            &session
        ));
        assert!(should_trigger_refresh(
            StatusCode::UNPROCESSABLE_ENTITY,
            false,
            &session
        ));
        assert!(!should_trigger_refresh(StatusCode::FORBIDDEN, false, &session));
        assert!(!should_trigger_refresh(StatusCode::OK, false, &session));
    }

    #[test]
    fn test_no_reactive_trigger_on_excluded_path() {
        // A 401 from the refresh endpoint itself would otherwise recurse.
        let session = authenticated_session(1700003600);
        assert!(!should_trigger_refresh(
            StatusCode::UNAUTHORIZED,
            true,
            &session
        ));
    }

    #[test]
    fn test_no_reactive_trigger_without_session() {
        let session = Session {
            access_credential: None,
            access_expiry: None,
            hydrated: true,
        };
        assert!(!should_trigger_refresh(
            StatusCode::UNAUTHORIZED,
            false,
            &session
        ));
    }
}
