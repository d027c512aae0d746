//! HTTP transport: request construction, one-shot requests and downloads.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// HTTP method for a manager request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Everything needed to build one manager request.
#[derive(Debug, Clone)]
pub struct HttpRequestParams {
    pub method: HttpMethod,
    pub host: String,
    pub port: String,
    pub endpoint: String,
    pub user_agent: String,
    /// Bearer token; empty means none. Takes precedence over `user_pass`.
    pub token: String,
    /// Base64-encoded `user:password` for Basic auth; empty means none.
    pub user_pass: String,
    pub body: String,
    pub use_https: bool,
}

impl HttpRequestParams {
    pub fn new(
        method: HttpMethod,
        host: impl Into<String>,
        port: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            method,
            host: host.into(),
            port: port.into(),
            endpoint: endpoint.into(),
            user_agent: String::new(),
            token: String::new(),
            user_pass: String::new(),
            body: String::new(),
            use_https: false,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_basic_auth(mut self, user: &str, password: &str) -> Self {
        self.user_pass = BASE64.encode(format!("{user}:{password}").as_bytes());
        self
    }

    pub fn with_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    /// The full request URL.
    pub fn url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.endpoint)
    }
}

/// A received (or synthesized) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// A transport-level failure (nothing came back from the manager).
#[derive(Debug)]
pub struct TransportError {
    connect: bool,
    message: String,
}

impl TransportError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            connect: true,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            connect: false,
            message: message.into(),
        }
    }

    /// Whether the failure happened while establishing the connection.
    /// Connect failures back off; write/read failures retry immediately.
    pub fn is_connect(&self) -> bool {
        self.connect
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            TransportError::connect(e.to_string())
        } else {
            TransportError::io(e.to_string())
        }
    }
}

/// The seam the request loops run against: perform one request, report
/// transport failures distinctly from HTTP statuses.
#[async_trait]
pub trait HttpPerformer: Send + Sync {
    async fn perform(&self, params: &HttpRequestParams) -> Result<HttpResponse, TransportError>;
}

/// Stateless transport over a shared `reqwest::Client`.
pub struct HttpTransport {
    client: Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Build a request honoring the construction invariants: JSON accept
    /// header, bearer token over basic auth, JSON content type when a body
    /// is present.
    fn build(&self, params: &HttpRequestParams) -> reqwest::RequestBuilder {
        let mut req = match params.method {
            HttpMethod::Get => self.client.get(params.url()),
            HttpMethod::Post => self.client.post(params.url()),
        };

        req = req.header(ACCEPT, "application/json");

        if !params.user_agent.is_empty() {
            req = req.header(USER_AGENT, params.user_agent.clone());
        }

        if !params.token.is_empty() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", params.token));
        } else if !params.user_pass.is_empty() {
            req = req.header(AUTHORIZATION, format!("Basic {}", params.user_pass));
        }

        if !params.body.is_empty() {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(params.body.clone());
        }

        req
    }

    /// Perform one request, mapping every failure to a synthetic 500 so
    /// the caller's contract is total. Used for authentication.
    pub async fn request(&self, params: &HttpRequestParams) -> HttpResponse {
        match self.perform(params).await {
            Ok(response) => response,
            Err(e) => {
                debug!(endpoint = %params.endpoint, error = %e, "request failed");
                HttpResponse {
                    status: 500,
                    body: format!("Internal server error: {e}"),
                }
            }
        }
    }

    /// Perform one request and stream the response body to `dst`.
    ///
    /// The returned response carries an empty body on success; failures are
    /// synthesized as 500 like [`request`](Self::request).
    pub async fn request_download(&self, params: &HttpRequestParams, dst: &Path) -> HttpResponse {
        let result: Result<HttpResponse, TransportError> = async {
            let response = self.build(params).send().await?;
            let status = response.status().as_u16();

            if status != 200 {
                let body = response.text().await.unwrap_or_default();
                return Ok(HttpResponse { status, body });
            }

            let mut file = tokio::fs::File::create(dst)
                .await
                .map_err(|e| TransportError::io(format!("failed to create {}: {e}", dst.display())))?;

            let mut response = response;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| TransportError::io(format!("failed to write {}: {e}", dst.display())))?;
            }
            file.flush()
                .await
                .map_err(|e| TransportError::io(format!("failed to flush {}: {e}", dst.display())))?;

            Ok(HttpResponse {
                status,
                body: String::new(),
            })
        }
        .await;

        match result {
            Ok(response) => response,
            Err(e) => {
                error!(endpoint = %params.endpoint, error = %e, "download failed");
                HttpResponse {
                    status: 500,
                    body: format!("Internal server error: {e}"),
                }
            }
        }
    }

    /// Authenticate with the enrollment uuid and key.
    ///
    /// POSTs `{"uuid": ..., "key": ...}` to `/api/v1/authentication` and
    /// returns the token from a 200 response. Parse failures are treated
    /// as authentication failures.
    pub async fn authenticate_with_uuid_and_key(
        &self,
        host: &str,
        port: &str,
        user_agent: &str,
        uuid: &str,
        key: &str,
        use_https: bool,
    ) -> Option<String> {
        let body = serde_json::json!({ "uuid": uuid, "key": key }).to_string();
        let params = HttpRequestParams::new(HttpMethod::Post, host, port, "/api/v1/authentication")
            .with_user_agent(user_agent)
            .with_body(body)
            .with_https(use_https);

        let response = self.request(&params).await;
        if !response.is_ok() {
            debug!(status = response.status, "uuid/key authentication rejected");
            return None;
        }

        match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(json) => json
                .get("token")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            Err(e) => {
                error!(error = %e, "failed to parse authentication response");
                None
            }
        }
    }

    /// Authenticate with a username and password over Basic auth.
    ///
    /// POSTs to `/security/user/authenticate` and returns the token at
    /// `.data.token` from a 200 response.
    pub async fn authenticate_with_user_password(
        &self,
        host: &str,
        port: &str,
        user_agent: &str,
        user: &str,
        password: &str,
        use_https: bool,
    ) -> Option<String> {
        let params =
            HttpRequestParams::new(HttpMethod::Post, host, port, "/security/user/authenticate")
                .with_user_agent(user_agent)
                .with_basic_auth(user, password)
                .with_https(use_https);

        let response = self.request(&params).await;
        if !response.is_ok() {
            debug!(status = response.status, "user/password authentication rejected");
            return None;
        }

        match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(json) => json
                .get("data")
                .and_then(|d| d.get("token"))
                .and_then(|t| t.as_str())
                .map(str::to_string),
            Err(e) => {
                error!(error = %e, "failed to parse authentication response");
                None
            }
        }
    }
}

#[async_trait]
impl HttpPerformer for HttpTransport {
    async fn perform(&self, params: &HttpRequestParams) -> Result<HttpResponse, TransportError> {
        let response = self.build(params).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_construction() {
        let params = HttpRequestParams::new(HttpMethod::Get, "manager.local", "27000", "/commands");
        assert_eq!(params.url(), "http://manager.local:27000/commands");

        let params = params.with_https(true);
        assert_eq!(params.url(), "https://manager.local:27000/commands");
    }

    #[test]
    fn basic_auth_is_base64_user_colon_password() {
        let params = HttpRequestParams::new(HttpMethod::Post, "h", "1", "/")
            .with_basic_auth("wazoo", "hunter2");
        assert_eq!(
            params.user_pass,
            BASE64.encode("wazoo:hunter2".as_bytes())
        );
    }

    #[test]
    fn response_status_predicates() {
        let ok = HttpResponse {
            status: 200,
            body: String::new(),
        };
        assert!(ok.is_ok());
        assert!(!ok.is_unauthorized());

        for status in [401, 403] {
            let denied = HttpResponse {
                status,
                body: String::new(),
            };
            assert!(denied.is_unauthorized());
            assert!(!denied.is_ok());
        }
    }

    #[test]
    fn transport_error_classification() {
        assert!(TransportError::connect("no route").is_connect());
        assert!(!TransportError::io("reset by peer").is_connect());
    }

    #[tokio::test]
    async fn request_against_unreachable_host_synthesizes_500() {
        let transport = HttpTransport::new();
        // Port 1 on loopback refuses immediately.
        let params = HttpRequestParams::new(HttpMethod::Get, "127.0.0.1", "1", "/commands");

        let response = transport.request(&params).await;
        assert_eq!(response.status, 500);
        assert!(response.body.starts_with("Internal server error:"));
    }
}
