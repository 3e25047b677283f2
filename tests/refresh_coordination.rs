//! Concurrency and lifecycle properties of the refresh coordinator and the
//! middleware pipelines, exercised against in-memory stores and a counting
//! mock backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::header::COOKIE;
use reqwest::StatusCode;

use authflow::pipeline::{
    AuthRejectionWatch, CredentialInjector, RequestMiddleware, ResponseMiddleware,
};
use authflow::{
    Config, CookieTransport, IssuedCredentials, KeyValueStore, MemoryStore, RefreshBackend,
    RefreshCoordinator, RefreshError, SessionStore,
};

/// Captures the crate's tracing output in test output. Safe to call from
/// every test; only the first call installs the subscriber.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("authflow=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

struct MockBackend {
    calls: AtomicUsize,
    delay: Duration,
    result: Result<IssuedCredentials, RefreshError>,
}

impl MockBackend {
    fn new(result: Result<IssuedCredentials, RefreshError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            result,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshBackend for MockBackend {
    async fn exchange(
        &self,
        refresh_credential: Option<&str>,
    ) -> Result<IssuedCredentials, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match refresh_credential {
            Some(_) => self.result.clone(),
            None => Err(RefreshError::NoRefreshCredential),
        }
    }
}

fn issued(access: &str, expiry: i64) -> IssuedCredentials {
    IssuedCredentials {
        access_credential: access.to_string(),
        access_expiry: Some(expiry),
        refresh_credential: None,
    }
}

struct Harness {
    config: Config,
    backing: Arc<MemoryStore>,
    transport: Arc<CookieTransport>,
    session: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
}

fn harness(backend: Arc<MockBackend>) -> Harness {
    init_tracing();
    let config = Config::new("https://api.example.test");
    let backing = Arc::new(MemoryStore::new());
    let transport = Arc::new(CookieTransport::new(backing.clone()));
    let session = Arc::new(SessionStore::new(transport.clone()));
    let coordinator = Arc::new(RefreshCoordinator::new(session.clone(), backend, &config));
    Harness {
        config,
        backing,
        transport,
        session,
        coordinator,
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_triggers_share_one_backend_call() {
    let expiry = Utc::now().timestamp() + 3600;
    let backend = MockBackend::new(Ok(issued("a1", expiry)), Duration::from_millis(50));
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let outcomes = join_all((0..8).map(|_| h.coordinator.refresh())).await;

    assert_eq!(backend.calls(), 1);
    assert!(outcomes.iter().all(|outcome| outcome.is_ok()));

    let session = h.session.get();
    assert_eq!(session.access_credential.as_deref(), Some("a1"));
    assert_eq!(session.access_expiry, Some(expiry));
}

#[tokio::test(start_paused = true)]
async fn test_shared_failure_denies_all_and_clears_session() {
    let backend = MockBackend::new(
        Err(RefreshError::Rejected { status: 401 }),
        Duration::from_millis(50),
    );
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_access_credential("stale", Utc::now().timestamp() - 1).await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let outcomes = join_all((0..4).map(|_| h.coordinator.refresh())).await;

    assert_eq!(backend.calls(), 1);
    for outcome in outcomes {
        assert_eq!(outcome, Err(RefreshError::Rejected { status: 401 }));
    }

    // Session is cleared in memory and in the durable store.
    assert_eq!(h.session.get().access_credential, None);
    assert_eq!(h.backing.get("access_token").await.unwrap(), None);
    assert_eq!(h.backing.get("refresh_token").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_later_trigger_starts_a_new_cycle() {
    // A request arriving after the previous cycle resolved must get a fresh
    // backend call, not the stale shared outcome.
    let expiry = Utc::now().timestamp() + 3600;
    let backend = MockBackend::new(Ok(issued("a1", expiry)), Duration::from_millis(50));
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_refresh_credential("r0").await.unwrap();

    h.coordinator.refresh().await.unwrap();
    h.coordinator.refresh().await.unwrap();

    assert_eq!(backend.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_timeout_is_failure() {
    // Default refresh timeout is 10s; the backend hangs for 60s.
    let expiry = Utc::now().timestamp() + 3600;
    let backend = MockBackend::new(Ok(issued("a1", expiry)), Duration::from_secs(60));
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_access_credential("stale", Utc::now().timestamp() - 1).await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let outcome = h.coordinator.refresh().await;

    assert_eq!(outcome, Err(RefreshError::TimedOut));
    assert_eq!(h.session.get().access_credential, None);
}

#[tokio::test(start_paused = true)]
async fn test_rotated_refresh_credential_is_persisted() {
    let expiry = Utc::now().timestamp() + 3600;
    let backend = MockBackend::new(
        Ok(IssuedCredentials {
            access_credential: "a1".to_string(),
            access_expiry: Some(expiry),
            refresh_credential: Some("r1".to_string()),
        }),
        Duration::from_millis(10),
    );
    let h = harness(backend);

    h.session.hydrate().await;
    h.session.set_refresh_credential("r0").await.unwrap();

    h.coordinator.refresh().await.unwrap();

    assert_eq!(
        h.backing.get("refresh_token").await.unwrap(),
        Some("r1".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_request_refreshes_once_before_injection() {
    let expiry = Utc::now().timestamp() + 3600;
    let backend = MockBackend::new(Ok(issued("a1", expiry)), Duration::from_millis(50));
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let injector = CredentialInjector::new(
        h.session.clone(),
        h.transport.clone(),
        h.coordinator.clone(),
        h.config.clone(),
    );
    let http = reqwest::Client::new();

    // Two requests in the same scheduling tick both observe the stale
    // session; one backend call serves both.
    let first = http.get("https://api.example.test/api/items").build().unwrap();
    let second = http.get("https://api.example.test/api/items").build().unwrap();
    let (first, second) = futures::join!(injector.handle(first), injector.handle(second));

    assert_eq!(backend.calls(), 1);
    for request in [first.unwrap(), second.unwrap()] {
        assert_eq!(
            request.headers().get(COOKIE).unwrap().to_str().unwrap(),
            "access_token=a1"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_no_refresh_decision_before_hydration() {
    let backend = MockBackend::new(
        Ok(issued("a1", Utc::now().timestamp() + 3600)),
        Duration::from_millis(10),
    );
    let h = harness(backend.clone());
    h.session.set_refresh_credential("r0").await.unwrap();

    let injector = CredentialInjector::new(
        h.session.clone(),
        h.transport.clone(),
        h.coordinator.clone(),
        h.config.clone(),
    );
    let request = reqwest::Client::new()
        .get("https://api.example.test/api/items")
        .build()
        .unwrap();
    let request = injector.handle(request).await.unwrap();

    assert_eq!(backend.calls(), 0);
    assert!(request.headers().get(COOKIE).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_excluded_path_skips_refresh_and_carries_refresh_credential() {
    let backend = MockBackend::new(
        Ok(issued("a1", Utc::now().timestamp() + 3600)),
        Duration::from_millis(10),
    );
    let h = harness(backend.clone());

    h.session.hydrate().await;
    // Stale access credential: a non-excluded request would refresh here.
    h.session.set_access_credential("old", Utc::now().timestamp() - 1).await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let injector = CredentialInjector::new(
        h.session.clone(),
        h.transport.clone(),
        h.coordinator.clone(),
        h.config.clone(),
    );
    let request = reqwest::Client::new()
        .post("https://api.example.test/api/auth/refresh")
        .build()
        .unwrap();
    let request = injector.handle(request).await.unwrap();

    assert_eq!(backend.calls(), 0);
    assert_eq!(
        request.headers().get(COOKIE).unwrap().to_str().unwrap(),
        "refresh_token=r0; access_token=old"
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejection_response_triggers_refresh_and_passes_through() {
    let expiry = Utc::now().timestamp() + 3600;
    let backend = MockBackend::new(Ok(issued("a1", expiry)), Duration::from_millis(10));
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_access_credential("old", expiry).await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let watch = AuthRejectionWatch::new(h.session.clone(), h.coordinator.clone(), h.config.clone());
    let rejection = http::Response::builder()
        .status(http::StatusCode::UNAUTHORIZED)
        .body("")
        .unwrap();

    let response = watch.handle(reqwest::Response::from(rejection)).await.unwrap();

    // The triggering response is returned unmodified; the refresh happened
    // on the side.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.calls(), 1);
    assert_eq!(h.session.get().access_credential.as_deref(), Some("a1"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_reactive_refresh_logs_out() {
    let backend = MockBackend::new(
        Err(RefreshError::Rejected { status: 401 }),
        Duration::from_millis(10),
    );
    let h = harness(backend.clone());

    h.session.hydrate().await;
    h.session.set_access_credential("old", Utc::now().timestamp() + 3600).await;
    h.session.set_refresh_credential("r0").await.unwrap();

    let logged_out = Arc::new(AtomicUsize::new(0));
    let seen = logged_out.clone();
    h.session.subscribe(move |session| {
        if session.hydrated && !session.is_authenticated() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    let watch = AuthRejectionWatch::new(h.session.clone(), h.coordinator.clone(), h.config.clone());
    let rejection = http::Response::builder()
        .status(http::StatusCode::UNPROCESSABLE_ENTITY)
        .body("")
        .unwrap();
    let response = watch.handle(reqwest::Response::from(rejection)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.session.get().access_credential, None);
    assert_eq!(logged_out.load(Ordering::SeqCst), 1);
}
