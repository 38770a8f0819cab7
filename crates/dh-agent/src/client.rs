//! Control-plane HTTP client
//!
//! A thin typed layer over `reqwest` that attaches the agent token, joins
//! node URLs, and classifies responses so callers can decide which
//! failures are worth retrying.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use thiserror::Error;

use dh_protocol::{NodeRecord, NodeStatus, ProtocolError, RegistrationRequest, TOKEN_SCHEME};

/// Node resource relative to the control-plane base URL
pub const NODE_ENDPOINT: &str = "api/agent/node/";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by control-plane and download requests
#[derive(Debug, Error)]
pub enum ClientError {
    /// 401: the agent token was rejected
    #[error("401 Unauthorized")]
    Unauthorized,

    /// 404: the resource (usually the node UUID) does not exist
    #[error("404 Not Found")]
    NotFound,

    /// Any other unsuccessful status
    #[error("unexpected status {0}")]
    Status(StatusCode),

    /// Network or TLS failure
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not decode
    #[error("malformed response: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Whether the control plane rejected the node's identity (401 or 404)
    pub fn is_identity_rejection(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::NotFound)
    }
}

/// Join two URL fragments with exactly one slash and a trailing slash
pub fn join_url(base: &str, path: &str) -> String {
    let mut url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Build the HTTP client shared by all agent components
pub fn http_client() -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("dockhand-agent/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Plain GET of a document or artifact, without agent credentials
pub async fn fetch(http: &reqwest::Client, url: &str) -> Result<Bytes, ClientError> {
    let response = http.get(url).send().await?;
    match response.status() {
        status if status.is_success() => Ok(response.bytes().await?),
        StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
        StatusCode::NOT_FOUND => Err(ClientError::NotFound),
        status => Err(ClientError::Status(status)),
    }
}

/// Authenticated client for the node resource
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    node_url: String,
    token: String,
    debug: bool,
}

impl ControlPlaneClient {
    /// Create a client for the control plane at `base_url`
    pub fn new(http: reqwest::Client, base_url: &str, token: impl Into<String>) -> Self {
        Self {
            http,
            node_url: join_url(base_url, NODE_ENDPOINT),
            token: token.into(),
            debug: false,
        }
    }

    /// Trace request and response bodies at debug level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// URL of the node resource; an empty UUID yields the collection URL
    pub fn node_url(&self, uuid: &str) -> String {
        join_url(&self.node_url, uuid)
    }

    /// Send an authenticated JSON request to the node resource
    ///
    /// Only 200, 201 and 202 count as success.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        uuid: &str,
        body: Option<&B>,
    ) -> Result<Bytes, ClientError> {
        let url = self.node_url(uuid);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("Authorization", format!("{} {}", TOKEN_SCHEME, self.token))
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            let payload = serde_json::to_vec(body).map_err(ProtocolError::from)?;
            if self.debug {
                tracing::debug!(
                    "=> {} {} body: {}",
                    method,
                    url,
                    String::from_utf8_lossy(&payload)
                );
            }
            request = request.body(payload);
        } else if self.debug {
            tracing::debug!("=> {} {}", method, url);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if self.debug {
            tracing::debug!("<= {} body: {}", status, String::from_utf8_lossy(&body));
        }

        match status.as_u16() {
            200 | 201 | 202 => {
                tracing::debug!("{} {}: {}", method, url, status);
                Ok(body)
            }
            401 => Err(ClientError::Unauthorized),
            404 => Err(ClientError::NotFound),
            _ => Err(ClientError::Status(status)),
        }
    }

    /// POST a new node
    pub async fn create_node(
        &self,
        request: &RegistrationRequest,
    ) -> Result<NodeRecord, ClientError> {
        let body = self.send(Method::POST, "", Some(request)).await?;
        Ok(NodeRecord::from_slice(&body)?)
    }

    /// PATCH an existing node
    pub async fn patch_node<B: Serialize + ?Sized>(
        &self,
        uuid: &str,
        patch: &B,
    ) -> Result<Bytes, ClientError> {
        self.send(Method::PATCH, uuid, Some(patch)).await
    }

    /// PATCH an existing node and decode the returned node record
    pub async fn update_node<B: Serialize + ?Sized>(
        &self,
        uuid: &str,
        patch: &B,
    ) -> Result<NodeRecord, ClientError> {
        let body = self.patch_node(uuid, patch).await?;
        Ok(NodeRecord::from_slice(&body)?)
    }

    /// GET the node status
    pub async fn get_node(&self, uuid: &str) -> Result<NodeStatus, ClientError> {
        let body = self.send::<()>(Method::GET, uuid, None).await?;
        Ok(NodeStatus::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://a/", "/b"), "https://a/b/");
        assert_eq!(join_url("https://a", "b"), "https://a/b/");
        assert_eq!(join_url("https://a/", "b/"), "https://a/b/");
        assert_eq!(join_url("https://a/b/", ""), "https://a/b/");
    }

    #[test]
    fn test_node_urls() {
        let client =
            ControlPlaneClient::new(reqwest::Client::new(), "https://dashboard.example.com", "t");
        assert_eq!(client.node_url(""), "https://dashboard.example.com/api/agent/node/");
        assert_eq!(
            client.node_url("abc"),
            "https://dashboard.example.com/api/agent/node/abc/"
        );
    }

    #[test]
    fn test_identity_rejection_classification() {
        assert!(ClientError::Unauthorized.is_identity_rejection());
        assert!(ClientError::NotFound.is_identity_rejection());
        assert!(!ClientError::Status(StatusCode::BAD_GATEWAY).is_identity_rejection());
    }
}
