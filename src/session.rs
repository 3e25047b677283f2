//! Session snapshot and the session store.
//!
//! The session is the only shared mutable resource in the crate. It is
//! constructed once per process, hydrated asynchronously from durable
//! storage, and mutated through exactly two entry points
//! (`set_access_credential` and `clear`). The pipelines and the refresh
//! coordinator read it through cheap synchronous snapshots; UI-level guards
//! observe it through `subscribe`.

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::transport::CredentialTransport;

/// Point-in-time view of credential state. `hydrated` is false until the
/// initial load from durable storage completes; before that, an absent
/// credential must not be read as "logged out".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_credential: Option<String>,
    /// Seconds since epoch. Present whenever `access_credential` is.
    pub access_expiry: Option<i64>,
    pub hydrated: bool,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.access_credential.is_some()
    }

    /// True when the access credential cannot be trusted at `now`: absent,
    /// missing its expiry, or past it. Expiry bookkeeping is imprecise by
    /// design; the reactive 401/422 path backstops any optimism here.
    pub fn is_stale_at(&self, now: i64) -> bool {
        match (&self.access_credential, self.access_expiry) {
            (Some(_), Some(expiry)) => expiry <= now,
            _ => true,
        }
    }

    /// Seconds until expiry, if an expiry is known. Negative when past.
    pub fn expires_in(&self, now: i64) -> Option<i64> {
        self.access_expiry.map(|expiry| expiry - now)
    }
}

type Subscriber = Arc<dyn Fn(&Session) + Send + Sync>;
type LogoutCallout = Box<dyn Fn(Session) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct SessionStore {
    transport: Arc<dyn CredentialTransport>,
    state: Mutex<Session>,
    subscribers: Mutex<Vec<Subscriber>>,
    logout_callout: Mutex<Option<LogoutCallout>>,
}

impl SessionStore {
    pub fn new(transport: Arc<dyn CredentialTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(Session::default()),
            subscribers: Mutex::new(Vec::new()),
            logout_callout: Mutex::new(None),
        }
    }

    /// Current snapshot. Never blocks on IO.
    pub fn get(&self) -> Session {
        self.state.lock().clone()
    }

    /// Registers a callback invoked synchronously on every state transition.
    /// Used by navigation-level guards; the refresh coordinator mutates the
    /// store through direct calls instead, so notification ordering never
    /// feeds back into refresh decisions.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Arc::new(callback));
    }

    /// Wires the backend logout collaborator invoked by `clear()`. It
    /// receives the pre-clear snapshot so the call can still authenticate
    /// itself; its outcome never blocks the local clear.
    pub fn set_logout_callout<F, Fut>(&self, callout: F)
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        *self.logout_callout.lock() = Some(Box::new(move |session| callout(session).boxed()));
    }

    fn notify(&self, snapshot: &Session) {
        // A callback may itself call subscribe, so the list is snapshotted
        // and the lock released before any callback runs.
        let subscribers: Vec<Subscriber> = self.subscribers.lock().clone();
        for subscriber in &subscribers {
            subscriber(snapshot);
        }
    }

    /// Loads persisted credential state. `hydrated` flips false→true exactly
    /// once, including when the durable read fails: the session then
    /// proceeds empty rather than blocking guards forever.
    pub async fn hydrate(&self) {
        if self.state.lock().hydrated {
            return;
        }

        let access = match self.transport.load_access_credential().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "Failed to load persisted access credential");
                None
            }
        };
        let expiry = match self.transport.load_access_expiry().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "Failed to load persisted access expiry");
                None
            }
        };

        // An access credential never exists without a known expiry; a
        // persisted credential whose expiry did not survive is dropped.
        let (access, expiry) = match (access, expiry) {
            (Some(access), Some(expiry)) => (Some(access), Some(expiry)),
            (Some(_), None) => {
                debug!("Dropping persisted access credential with no expiry");
                (None, None)
            }
            (None, _) => (None, None),
        };

        let snapshot = {
            let mut state = self.state.lock();
            // Re-checked under the lock: a concurrent hydrate may have won
            // the race while the durable read was in flight.
            if state.hydrated {
                return;
            }
            // A credential installed while the read was in flight (login,
            // refresh) wins over the persisted one.
            if state.access_credential.is_none() {
                state.access_credential = access;
                state.access_expiry = expiry;
            }
            state.hydrated = true;
            state.clone()
        };
        debug!(authenticated = snapshot.is_authenticated(), "Session hydrated");
        self.notify(&snapshot);
    }

    /// Updates the in-memory credential first, then persists. Persistence
    /// failure is logged and never rolls back the in-memory update: session
    /// usability in the current process takes precedence over durability.
    pub async fn set_access_credential(&self, value: &str, expiry: i64) {
        let snapshot = {
            let mut state = self.state.lock();
            state.access_credential = Some(value.to_string());
            state.access_expiry = Some(expiry);
            state.clone()
        };
        self.notify(&snapshot);

        if let Err(err) = self.transport.store_access_credential(value).await {
            warn!(error = %err, "Failed to persist access credential");
        }
        if let Err(err) = self.transport.store_access_expiry(expiry).await {
            warn!(error = %err, "Failed to persist access expiry");
        }
    }

    /// The refresh credential has no in-memory copy; reads and writes go
    /// straight to the transport's durable store.
    pub async fn refresh_credential(&self) -> Result<Option<String>> {
        self.transport.load_refresh_credential().await
    }

    pub async fn set_refresh_credential(&self, value: &str) -> Result<()> {
        self.transport.persist_refresh_credential(value).await
    }

    /// Tears the session down: best-effort backend logout with the pre-clear
    /// credentials, then the in-memory wipe, then durable deletion. A crash
    /// after the wipe can leave a stale durable credential behind; it is
    /// unusable because the next hydration re-validates against the backend
    /// on first use.
    pub async fn clear(&self) {
        let snapshot = self.get();

        let callout = {
            let guard = self.logout_callout.lock();
            guard.as_ref().map(|callout| callout(snapshot))
        };
        if let Some(callout) = callout {
            callout.await;
        }

        let snapshot = {
            let mut state = self.state.lock();
            state.access_credential = None;
            state.access_expiry = None;
            state.clone()
        };
        debug!("Session cleared");
        self.notify(&snapshot);

        if let Err(err) = self.transport.delete_access_credential().await {
            warn!(error = %err, "Failed to delete persisted access credential");
        }
        if let Err(err) = self.transport.delete_access_expiry().await {
            warn!(error = %err, "Failed to delete persisted access expiry");
        }
        if let Err(err) = self.transport.delete_refresh_credential().await {
            warn!(error = %err, "Failed to delete persisted refresh credential");
        }
    }
}
