//! Bearer credentials
//!
//! The sync core never stores credentials itself. It asks a `TokenProvider`
//! for the current token on every request. `AuthClient` obtains one from the
//! login/signup endpoints and keeps it in a `SessionToken` for the life of
//! the process.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Source of the bearer credential attached to REST calls
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` when the user is not authenticated
    fn token(&self) -> Option<String>;
}

/// Fixed token (configuration, environment, tests)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// In-memory replaceable token. Never persisted.
#[derive(Debug, Default)]
pub struct SessionToken {
    inner: RwLock<Option<String>>,
}

impl SessionToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Some(token.into())),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
}

impl TokenProvider for SessionToken {
    fn token(&self) -> Option<String> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }
}

// ============================================================================
// Login / signup
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Body returned by `/auth/login` and `/auth/signup`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user_id: i64,
    pub email: String,
    pub name: String,
}

/// Client for the authentication endpoints
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionToken>,
}

impl AuthClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        session: Arc<SessionToken>,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        })
    }

    /// The token holder updated by `login`/`signup`
    pub fn session(&self) -> Arc<SessionToken> {
        self.session.clone()
    }

    /// `POST /auth/login`; stores the returned token on success
    pub async fn login(&self, email: &str, password: &str) -> SyncResult<AuthResponse> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        self.authenticate("/auth/login", &body).await
    }

    /// `POST /auth/signup`; stores the returned token on success
    pub async fn signup(&self, name: &str, email: &str, password: &str) -> SyncResult<AuthResponse> {
        let body = SignupRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        self.authenticate("/auth/signup", &body).await
    }

    pub fn logout(&self) {
        self.session.clear();
        debug!("Session token cleared");
    }

    async fn authenticate<B: Serialize>(&self, path: &str, body: &B) -> SyncResult<AuthResponse> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), &text));
        }
        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        self.session.set(auth.token.clone());
        info!(user_id = auth.user_id, email = %auth.email, "Authenticated");
        Ok(auth)
    }
}
