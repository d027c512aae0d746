//! Shared-group configuration download.
//!
//! When the manager reassigns this agent's groups, the new group overlay
//! files are fetched over the authenticated channel and streamed to disk
//! for the configuration layer to merge.

use std::path::Path;

use tracing::{error, info};

use palisade_types::PalisadeError;

use crate::http::{HttpMethod, HttpRequestParams, HttpTransport};

/// Download one group's configuration file to `dst`.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_group_configuration(
    transport: &HttpTransport,
    host: &str,
    port: &str,
    user_agent: &str,
    token: &str,
    use_https: bool,
    group_id: &str,
    dst: &Path,
) -> Result<(), PalisadeError> {
    let endpoint = format!("/api/v1/files?file_name={group_id}.yml");
    let mut params = HttpRequestParams::new(HttpMethod::Get, host, port, endpoint)
        .with_user_agent(user_agent)
        .with_https(use_https);
    params.token = token.to_string();

    let response = transport.request_download(&params, dst).await;
    if response.is_ok() {
        info!(group_id, dst = %dst.display(), "group configuration downloaded");
        Ok(())
    } else {
        error!(group_id, status = response.status, "group configuration download failed");
        Err(PalisadeError::Transport(format!(
            "group configuration download for '{group_id}' returned {}",
            response.status
        )))
    }
}
