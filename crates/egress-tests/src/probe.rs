//! HTTP client for the deployed nora test app.
//!
//! Nora exposes a reflective `/curl/{host}/{port}` endpoint: the app itself
//! curls the target from inside its container and reports the outcome as
//! `{"Stdout": .., "Stderr": .., "return_code": N}`. A zero return code
//! means egress to the target is allowed.

use crate::config::SecureAddress;
use crate::truncate_for_error;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Maximum length for a response body embedded in an error message.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Per-request timeout. The in-container curl has its own timeout, so this
/// only needs to cover it plus routing.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe errors.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Request to {path} failed with status {status}: {body}")]
    RequestFailed {
        path: String,
        status: u16,
        body: String,
    },

    #[error("Malformed curl response ({source}): {body}")]
    MalformedResponse {
        body: String,
        source: serde_json::Error,
    },
}

/// Outcome of the app's in-container curl.
///
/// Every field is required; a body missing `return_code` is a malformed
/// response, not a zero.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurlResponse {
    #[serde(rename = "Stdout")]
    pub stdout: String,

    #[serde(rename = "Stderr")]
    pub stderr: String,

    pub return_code: i32,
}

impl CurlResponse {
    /// Whether the in-container curl reached the target.
    pub fn egress_allowed(&self) -> bool {
        self.return_code == 0
    }
}

/// Parse a `/curl/{host}/{port}` response body.
pub fn parse_curl_response(body: &str) -> Result<CurlResponse, ProbeError> {
    serde_json::from_str(body).map_err(|source| ProbeError::MalformedResponse {
        body: truncate_for_error(body, MAX_ERROR_BODY_LEN),
        source,
    })
}

/// Client for one deployed app, addressed through its route.
pub struct AppClient {
    base_url: String,
    http_client: Client,
}

impl AppClient {
    /// Create a client for an arbitrary base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProbeError> {
        Self::build(base_url.into(), false)
    }

    /// Create a client for `http://{app_name}.{apps_domain}`.
    pub fn for_app(
        app_name: &str,
        apps_domain: &str,
        skip_ssl_validation: bool,
    ) -> Result<Self, ProbeError> {
        Self::build(app_url(app_name, apps_domain), skip_ssl_validation)
    }

    fn build(base_url: String, skip_ssl_validation: bool) -> Result<Self, ProbeError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(skip_ssl_validation)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Get the base URL of the app.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET a path on the app and return the body of a 2xx response.
    pub async fn get(&self, path: &str) -> Result<String, ProbeError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ProbeError::RequestFailed {
                path: path.to_string(),
                status: status.as_u16(),
                body: truncate_for_error(&body, MAX_ERROR_BODY_LEN),
            });
        }

        Ok(body)
    }

    /// GET the app root; nora answers with its greeting.
    pub async fn root(&self) -> Result<String, ProbeError> {
        self.get("/").await
    }

    /// Ask the app to curl `target` from inside its container.
    pub async fn curl(&self, target: &SecureAddress) -> Result<CurlResponse, ProbeError> {
        let body = self.get(&curl_path(target)).await?;
        let response = parse_curl_response(&body)?;

        tracing::debug!(
            destination = %target,
            return_code = response.return_code,
            "Egress probe"
        );

        Ok(response)
    }

    /// Egress probe: the in-container curl's return code.
    pub async fn egress_return_code(&self, target: &SecureAddress) -> Result<i32, ProbeError> {
        Ok(self.curl(target).await?.return_code)
    }
}

fn app_url(app_name: &str, apps_domain: &str) -> String {
    format!("http://{}.{}", app_name.to_ascii_lowercase(), apps_domain)
}

fn curl_path(target: &SecureAddress) -> String {
    format!("/curl/{}/{}", target.host, target.port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target() -> SecureAddress {
        SecureAddress {
            host: "10.0.16.5".to_string(),
            port: 8080,
        }
    }

    #[test]
    fn test_parse_blocked_response() {
        let response = parse_curl_response(
            r#"{"Stdout":"","Stderr":"curl: (7) couldn't connect to host","return_code":7}"#,
        )
        .unwrap();

        assert_eq!(response.return_code, 7);
        assert!(!response.egress_allowed());
        assert!(response.stderr.contains("couldn't connect"));
    }

    #[test]
    fn test_parse_allowed_response() {
        let response =
            parse_curl_response(r#"{"Stdout":"<html>ok</html>","Stderr":"","return_code":0}"#)
                .unwrap();
        assert!(response.egress_allowed());
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = parse_curl_response("<html>502 Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, ProbeError::MalformedResponse { .. }));
        assert!(err.to_string().contains("502 Bad Gateway"));
    }

    #[test]
    fn test_parse_rejects_missing_return_code() {
        let err = parse_curl_response(r#"{"Stdout":"","Stderr":""}"#).unwrap_err();
        assert!(
            matches!(err, ProbeError::MalformedResponse { .. }),
            "missing return_code must not default to 0"
        );
    }

    #[test]
    fn test_app_url_and_curl_path() {
        assert_eq!(
            app_url("DATS-1234", "bosh-lite.com"),
            "http://dats-1234.bosh-lite.com"
        );
        assert_eq!(curl_path(&target()), "/curl/10.0.16.5/8080");
    }

    #[tokio::test]
    async fn test_egress_return_code_from_app() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/curl/10.0.16.5/8080"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Stdout":"","Stderr":"connection refused","return_code":7}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = AppClient::new(server.uri()).unwrap();
        let code = client.egress_return_code(&target()).await.unwrap();

        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/curl/10.0.16.5/8080"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string("404 Not Found: Requested route does not exist."),
            )
            .mount(&server)
            .await;

        let client = AppClient::new(server.uri()).unwrap();
        let err = client.egress_return_code(&target()).await.unwrap_err();

        match err {
            ProbeError::RequestFailed { status, body, .. } => {
                assert_eq!(status, 404);
                assert!(body.contains("route does not exist"));
            }
            other => panic!("expected RequestFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_root_returns_greeting() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello i am nora"))
            .mount(&server)
            .await;

        let client = AppClient::new(format!("{}/", server.uri())).unwrap();
        assert_eq!(client.root().await.unwrap(), "hello i am nora");
    }
}
