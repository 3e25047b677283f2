//! authflow - session and token lifecycle coordination for authenticated
//! HTTP clients.
//!
//! Call sites issue plain requests through [`AuthClient`]; underneath, the
//! crate attaches credentials to outgoing requests, detects expiry, refreshes
//! against the authentication backend with a single-flight guarantee, and
//! tears the session down consistently on unrecoverable failure. Two
//! credential transports cover the two client runtimes: cookie headers for
//! browser-hosted clients and bearer headers with a platform secure store
//! for mobile clients.

pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod session;
pub mod storage;
pub mod transport;

pub use client::{AuthClient, AuthClientBuilder};
pub use config::Config;
pub use error::AuthError;
pub use refresh::{
    HttpRefreshBackend, IssuedCredentials, RefreshBackend, RefreshCoordinator, RefreshError,
};
pub use session::{Session, SessionStore};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
pub use transport::{
    CookieTransport, CredentialTransport, ExtractedCredentials, RequestCredentials,
    SecureStoreTransport,
};
