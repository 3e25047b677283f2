//! Authenticated HTTP client.
//!
//! `AuthClient` wraps a `reqwest::Client` with the session store, the
//! refresh coordinator, and the middleware pipelines, so call sites issue
//! plain requests and credential lifecycle is handled underneath them.

use std::sync::Arc;

use reqwest::{Client, Request, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AuthError;
use crate::pipeline::{
    AuthRejectionWatch, CredentialInjector, RequestMiddleware, ResponseMiddleware,
};
use crate::refresh::{HttpRefreshBackend, RefreshBackend, RefreshCoordinator};
use crate::session::{Session, SessionStore};
use crate::storage::MemoryStore;
use crate::transport::{CookieTransport, CredentialTransport};

/// Header carrying the caller-supplied CAPTCHA proof on login. The proof is
/// obtained out of band; this client only forwards it.
const CAPTCHA_PROOF_HEADER: &str = "hcaptcha-token";

#[derive(Debug, Serialize)]
struct LoginForm<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    access_token: Option<String>,
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection
/// pooling, and the rest of the state is shared behind Arcs.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    config: Config,
    session: Arc<SessionStore>,
    transport: Arc<dyn CredentialTransport>,
    request_pipeline: Arc<Vec<Arc<dyn RequestMiddleware>>>,
    response_pipeline: Arc<Vec<Arc<dyn ResponseMiddleware>>>,
}

impl AuthClient {
    pub fn builder(config: Config) -> AuthClientBuilder {
        AuthClientBuilder::new(config)
    }

    /// Loads persisted credentials. Call once at startup; request traffic
    /// issued earlier is sent without refresh decisions.
    pub async fn hydrate(&self) {
        self.session.hydrate().await;
    }

    /// The session store, for `get()`/`subscribe()` from navigation guards.
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs a request through the pipelines. Failures other than
    /// authentication rejection pass through unmodified; a rejection comes
    /// back as the original response after the reactive refresh has run, and
    /// callers retry at their own layer.
    pub async fn execute(&self, mut request: Request) -> Result<Response, AuthError> {
        for middleware in self.request_pipeline.iter() {
            request = middleware.handle(request).await?;
        }
        let mut response = self.http.execute(request).await?;
        for middleware in self.response_pipeline.iter() {
            response = middleware.handle(response).await?;
        }
        Ok(response)
    }

    pub async fn get(&self, path: &str) -> Result<Response, AuthError> {
        let request = self.http.get(self.config.endpoint(path)).build()?;
        self.execute(request).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response, AuthError> {
        let request = self
            .http
            .post(self.config.endpoint(path))
            .json(body)
            .build()?;
        self.execute(request).await
    }

    /// Authenticates with the backend and installs the issued credentials.
    /// `captcha_proof` is the verification token the caller obtained from
    /// the CAPTCHA widget.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        captcha_proof: &str,
    ) -> Result<Session, AuthError> {
        let request = self
            .http
            .post(self.config.endpoint(&self.config.login_path))
            .header(CAPTCHA_PROOF_HEADER, captcha_proof)
            .form(&LoginForm { username, password })
            .build()?;

        let response = self.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            debug!(%status, "Login rejected");
            return Err(AuthError::LoginRejected {
                status: status.as_u16(),
            });
        }

        let mut extracted = self.transport.extract_credentials(response.headers());
        if extracted.access_credential.is_none() {
            // Fall back to the JSON body when the response carries no
            // access cookie.
            if let Ok(body) = response.json::<LoginBody>().await {
                extracted.access_credential = body.access_token;
            }
        }

        let access = extracted
            .access_credential
            .ok_or(AuthError::MissingCredentials)?;

        if let Some(refresh) = &extracted.refresh_credential {
            if let Err(err) = self.session.set_refresh_credential(refresh).await {
                warn!(error = %err, "Failed to persist refresh credential after login");
            }
        }

        let expiry = extracted.access_expiry.unwrap_or_else(|| {
            chrono::Utc::now().timestamp() + self.config.default_access_ttl_secs
        });
        self.session.set_access_credential(&access, expiry).await;

        debug!(expiry, "Login succeeded");
        Ok(self.session.get())
    }

    /// Clears the session. The store's logout call-out notifies the backend
    /// best-effort before local state is wiped.
    pub async fn logout(&self) {
        self.session.clear().await;
    }
}

pub struct AuthClientBuilder {
    config: Config,
    transport: Option<Arc<dyn CredentialTransport>>,
    refresh_backend: Option<Arc<dyn RefreshBackend>>,
    extra_request_middleware: Vec<Arc<dyn RequestMiddleware>>,
    extra_response_middleware: Vec<Arc<dyn ResponseMiddleware>>,
}

impl AuthClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            refresh_backend: None,
            extra_request_middleware: Vec::new(),
            extra_response_middleware: Vec::new(),
        }
    }

    /// Credential transport variant. Defaults to a cookie transport over an
    /// in-memory store.
    pub fn transport(mut self, transport: Arc<dyn CredentialTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the backend exchange. The default talks to the configured
    /// refresh endpoint over HTTP.
    pub fn refresh_backend(mut self, backend: Arc<dyn RefreshBackend>) -> Self {
        self.refresh_backend = Some(backend);
        self
    }

    /// Appends a request middleware after credential injection.
    pub fn request_middleware(mut self, middleware: Arc<dyn RequestMiddleware>) -> Self {
        self.extra_request_middleware.push(middleware);
        self
    }

    /// Appends a response middleware after the rejection watch.
    pub fn response_middleware(mut self, middleware: Arc<dyn ResponseMiddleware>) -> Self {
        self.extra_response_middleware.push(middleware);
        self
    }

    pub fn build(self) -> Result<AuthClient, AuthError> {
        let config = self.config;
        let http = Client::builder().timeout(config.request_timeout()).build()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(CookieTransport::new(Arc::new(MemoryStore::new()))));
        let session = Arc::new(SessionStore::new(transport.clone()));

        // Backend logout call-out: POST the logout endpoint with the
        // pre-clear credentials. Best-effort by contract; any failure is
        // logged and local teardown proceeds.
        {
            let http = http.clone();
            let config = config.clone();
            let transport = transport.clone();
            session.set_logout_callout(move |snapshot: Session| {
                let http = http.clone();
                let config = config.clone();
                let transport = transport.clone();
                async move {
                    let credentials = match transport.request_credentials(&snapshot, true).await {
                        Ok(credentials) => credentials,
                        Err(err) => {
                            warn!(error = %err, "Failed to build logout credentials");
                            return;
                        }
                    };
                    let mut request =
                        match http.post(config.endpoint(&config.logout_path)).build() {
                            Ok(request) => request,
                            Err(err) => {
                                warn!(error = %err, "Failed to build logout request");
                                return;
                            }
                        };
                    if let Err(err) = credentials.apply(request.headers_mut()) {
                        warn!(error = %err, "Failed to attach logout credentials");
                        return;
                    }
                    match http.execute(request).await {
                        Ok(response) if !response.status().is_success() => {
                            debug!(status = %response.status(), "Backend logout rejected")
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Backend logout call failed"),
                    }
                }
            });
        }

        let backend = self.refresh_backend.unwrap_or_else(|| {
            Arc::new(HttpRefreshBackend::new(
                http.clone(),
                config.clone(),
                transport.clone(),
            ))
        });
        let coordinator = Arc::new(RefreshCoordinator::new(session.clone(), backend, &config));

        let mut request_pipeline: Vec<Arc<dyn RequestMiddleware>> =
            vec![Arc::new(CredentialInjector::new(
                session.clone(),
                transport.clone(),
                coordinator.clone(),
                config.clone(),
            ))];
        request_pipeline.extend(self.extra_request_middleware);

        let mut response_pipeline: Vec<Arc<dyn ResponseMiddleware>> =
            vec![Arc::new(AuthRejectionWatch::new(
                session.clone(),
                coordinator,
                config.clone(),
            ))];
        response_pipeline.extend(self.extra_response_middleware);

        Ok(AuthClient {
            http,
            config,
            session,
            transport,
            request_pipeline: Arc::new(request_pipeline),
            response_pipeline: Arc::new(response_pipeline),
        })
    }
}
