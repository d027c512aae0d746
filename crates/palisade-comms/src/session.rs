//! Bearer-token session lifecycle.
//!
//! [`SessionManager`] owns the token and its expiry. One long-lived task
//! runs [`wait_and_reauthenticate`](SessionManager::wait_and_reauthenticate),
//! refreshing the token two seconds before it expires; request loops that
//! hit a 401/403 call [`try_reauthenticate`](SessionManager::try_reauthenticate),
//! which cancels the refresh timer at most once per in-flight refresh.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use palisade_types::PalisadeError;

use crate::http::HttpTransport;
use crate::token::{token_expiry_epoch, TokenHolder};

/// How long before the `exp` claim the token is refreshed.
const TOKEN_PRE_EXPIRY_SECS: i64 = 2;

/// Sleep after a failed authentication attempt.
const AUTH_RETRY_SECS: u64 = 1;

/// The authentication seam: fetch a fresh token from the manager.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn fetch_token(&self) -> Option<String>;
}

/// Production authenticator: uuid + enrollment key against
/// `/api/v1/authentication`.
pub struct UuidKeyAuthenticator {
    transport: Arc<HttpTransport>,
    host: String,
    port: String,
    user_agent: String,
    uuid: String,
    key: String,
    use_https: bool,
}

impl UuidKeyAuthenticator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<HttpTransport>,
        host: impl Into<String>,
        port: impl Into<String>,
        user_agent: impl Into<String>,
        uuid: impl Into<String>,
        key: impl Into<String>,
        use_https: bool,
    ) -> Self {
        Self {
            transport,
            host: host.into(),
            port: port.into(),
            user_agent: user_agent.into(),
            uuid: uuid.into(),
            key: key.into(),
            use_https,
        }
    }
}

#[async_trait]
impl Authenticator for UuidKeyAuthenticator {
    async fn fetch_token(&self) -> Option<String> {
        self.transport
            .authenticate_with_uuid_and_key(
                &self.host,
                &self.port,
                &self.user_agent,
                &self.uuid,
                &self.key,
                self.use_https,
            )
            .await
    }
}

/// Owns the bearer token shared with every request loop.
pub struct SessionManager {
    authenticator: Arc<dyn Authenticator>,
    token: Arc<TokenHolder>,
    /// Epoch seconds of the token's `exp` claim; 1 when unusable, which
    /// forces an immediate retry.
    token_exp_epoch: AtomicI64,
    /// Cancels the refresh sleep; cancellation is a normal outcome.
    refresh_cancel: Notify,
    /// Single-flight guard for `try_reauthenticate`.
    reauth_guard: Mutex<()>,
    is_reauthenticating: AtomicBool,
}

impl SessionManager {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            token: Arc::new(TokenHolder::new()),
            token_exp_epoch: AtomicI64::new(0),
            refresh_cancel: Notify::new(),
            reauth_guard: Mutex::new(()),
            is_reauthenticating: AtomicBool::new(false),
        }
    }

    /// The shared token holder request loops snapshot from.
    pub fn token(&self) -> Arc<TokenHolder> {
        Arc::clone(&self.token)
    }

    /// Authenticate once.
    ///
    /// On success the token is stored and its `exp` claim parsed. A
    /// missing `exp` claim rejects the token: it is cleared and the expiry
    /// forced to 1 so the refresh loop retries immediately.
    pub async fn authenticate(&self) -> Result<(), PalisadeError> {
        let Some(fresh) = self.authenticator.fetch_token().await else {
            self.token.clear();
            self.token_exp_epoch.store(1, Ordering::Release);
            return Err(PalisadeError::Unauthorized(
                "manager rejected credentials".into(),
            ));
        };

        let Some(exp) = token_expiry_epoch(&fresh) else {
            warn!("token does not contain an exp claim, rejecting");
            self.token.clear();
            self.token_exp_epoch.store(1, Ordering::Release);
            return Err(PalisadeError::Unauthorized(
                "token missing exp claim".into(),
            ));
        };

        self.token.replace(fresh);
        self.token_exp_epoch.store(exp, Ordering::Release);
        info!(remaining_secs = self.remaining_secs(), "session token refreshed");
        Ok(())
    }

    /// Seconds until the token expires, never negative.
    pub fn remaining_secs(&self) -> i64 {
        let exp = self.token_exp_epoch.load(Ordering::Acquire);
        (exp - chrono::Utc::now().timestamp()).max(0)
    }

    /// How long to sleep before the next authentication attempt.
    fn refresh_delay(&self, authenticated: bool) -> Duration {
        if authenticated {
            let secs = (self.remaining_secs() - TOKEN_PRE_EXPIRY_SECS).max(0);
            Duration::from_secs(secs as u64)
        } else {
            Duration::from_secs(AUTH_RETRY_SECS)
        }
    }

    /// Long-lived refresh task: authenticate, sleep until just before
    /// expiry (or 1 s after a failure), repeat until shutdown.
    ///
    /// The sleep races against the cancel notification and shutdown;
    /// a cancelled sleep re-authenticates on the next iteration.
    pub async fn wait_and_reauthenticate(&self, mut shutdown: watch::Receiver<bool>) {
        info!("session refresh task started");

        while !*shutdown.borrow() {
            let authenticated = match self.authenticate().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "authentication failed");
                    false
                }
            };
            self.is_reauthenticating.store(false, Ordering::Release);

            let delay = self.refresh_delay(authenticated);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.refresh_cancel.notified() => {
                    debug!("token refresh timer cancelled");
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("session refresh task stopped");
    }

    /// Best-effort, single-flight re-authentication trigger.
    ///
    /// The winner cancels the refresh sleep so the refresh task
    /// re-authenticates immediately; every other concurrent caller returns
    /// `false` without action. The in-flight flag clears once the refresh
    /// task has completed the authentication attempt.
    pub fn try_reauthenticate(&self) -> bool {
        let Ok(_guard) = self.reauth_guard.try_lock() else {
            debug!("re-authentication already being triggered, skipping");
            return false;
        };

        if self.is_reauthenticating.swap(true, Ordering::AcqRel) {
            debug!("re-authentication already in progress, skipping");
            return false;
        }

        self.refresh_cancel.notify_one();
        debug!("re-authentication triggered");
        true
    }
}
