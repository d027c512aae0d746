//! The retrying request-loop kernel.
//!
//! All three manager pipelines (command poll, stateful push, stateless
//! push) are instances of [`run`] with different parameters. The loop is
//! self-healing: transport failures never escape, they only decide how
//! long to sleep before the next attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::http::{HttpPerformer, HttpRequestParams};
use crate::token::TokenHolder;

/// Produces the request body for the push pipelines and commits the drain
/// once the manager has accepted it.
#[async_trait]
pub trait BodySource: Send + Sync {
    /// Build the next request body. May suspend until data is available.
    async fn produce(&self) -> String;

    /// Called exactly once per 200 response; removes what `produce`
    /// drained, nothing fewer, nothing more.
    fn commit(&self);
}

/// Callback invoked with the response body of a 200.
pub type SuccessHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked on a 401/403.
pub type UnauthorizedHandler = Arc<dyn Fn() + Send + Sync>;

/// Run one pipeline until shutdown.
///
/// Per iteration: produce the body (if any), snapshot the shared token,
/// perform the request, then dispatch on the outcome:
///
/// - connect failure: warn, sleep `connection_retry`, retry
/// - write/read failure: error, retry immediately
/// - 200: `on_success(body)`, `body_source.commit()`, sleep `batch_interval`
/// - 401/403: `on_unauthorized()`, sleep `connection_retry`
/// - anything else: debug, sleep `batch_interval`
///
/// Token rotation is observed at the snapshot, so a refreshed token is
/// picked up on the next iteration without restarting the loop.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    performer: Arc<dyn HttpPerformer>,
    token: Arc<TokenHolder>,
    template: HttpRequestParams,
    body_source: Option<Arc<dyn BodySource>>,
    on_success: Option<SuccessHandler>,
    on_unauthorized: UnauthorizedHandler,
    connection_retry: Duration,
    batch_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(endpoint = %template.endpoint, "request loop started");

    while !*shutdown.borrow() {
        let mut params = template.clone();

        if let Some(source) = &body_source {
            tokio::select! {
                body = source.produce() => params.body = body,
                _ = shutdown.changed() => break,
            }
        }

        params.token = token.snapshot();

        let mut sleep_for = batch_interval;
        match performer.perform(&params).await {
            Err(e) if e.is_connect() => {
                warn!(
                    endpoint = %params.endpoint,
                    retry_secs = connection_retry.as_secs(),
                    "failed to reach manager, retrying"
                );
                debug!(endpoint = %params.endpoint, error = %e, "connect failure");
                sleep(connection_retry, &mut shutdown).await;
                continue;
            }
            Err(e) => {
                error!(endpoint = %params.endpoint, error = %e, "request failed");
                continue;
            }
            Ok(response) => {
                if response.is_ok() {
                    if let Some(handler) = &on_success {
                        handler(&response.body);
                    }
                    if let Some(source) = &body_source {
                        source.commit();
                    }
                } else if response.is_unauthorized() {
                    on_unauthorized();
                    sleep_for = connection_retry;
                }
                debug!(endpoint = %params.endpoint, status = response.status, "response received");
            }
        }

        sleep(sleep_for, &mut shutdown).await;
    }

    info!(endpoint = %template.endpoint, "request loop stopped");
}

/// Sleep raced against shutdown; returns early when the agent stops.
async fn sleep(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}
