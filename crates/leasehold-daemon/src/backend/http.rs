//! HTTP [`BackendStore`] adapter.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call               | Request                                  |
//! |--------------------|------------------------------------------|
//! | `get_agreement`    | `GET /agreement/{address}`               |
//! | `create_agreement` | `POST /agreement`                        |
//! | `update_status`    | `PUT /agreement/{address}/status`        |
//! | `record_payment`   | `POST /agreement/{address}/payment`      |
//!
//! Status mapping: 2xx succeeds, 404 on `GET` means absent, 408, 429 and
//! 5xx are transient, any other 4xx is permanent. Transport failures are
//! transient.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Collected, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use leasehold_core::agreement::Address;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use super::{AgreementRecord, BackendStore, BackendWriteError, PaymentRecord, StatusUpdate};

const USER_AGENT: &str = concat!("leasehold-daemon/", env!("CARGO_PKG_VERSION"));

/// Opaque authenticated-principal token, forwarded as a bearer credential.
#[derive(Clone)]
pub struct SessionToken(SecretString);

impl SessionToken {
    /// Wraps a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Reads the token from environment variable `var`.
    #[must_use]
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// REST client for the backend mirror.
pub struct HttpBackendStore {
    base_url: String,
    token: Option<SessionToken>,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl fmt::Debug for HttpBackendStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackendStore")
            .field("base_url", &self.base_url)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl HttpBackendStore {
    /// Creates a client for `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<SessionToken>) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), BackendWriteError> {
        let mut request = Request::builder()
            .method(method.clone())
            .uri(url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT);
        if body.is_some() {
            request = request.header("Content-Type", "application/json");
        }
        if let Some(token) = &self.token {
            request = request.header(
                "Authorization",
                format!("Bearer {}", token.0.expose_secret()),
            );
        }
        let request = request
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| BackendWriteError::Permanent(format!("invalid request: {e}")))?;

        debug!(method = %method, url = %url, "backend request");

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e: hyper_util::client::legacy::Error| {
                BackendWriteError::Transient(e.to_string())
            })?;
        let status = response.status();
        let collected: Result<Collected<Bytes>, hyper::Error> = response.into_body().collect().await;
        let bytes = collected
            .map(Collected::to_bytes)
            .map_err(|e| BackendWriteError::Transient(format!("reading body: {e}")))?;
        Ok((status, bytes))
    }

    async fn write<T: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<(), BackendWriteError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| BackendWriteError::Permanent(format!("encoding body: {e}")))?;
        let url = self.url(path);
        let (status, bytes) = self.send(method, &url, Some(payload)).await?;
        classify_status(status, &bytes)
    }
}

/// Maps a response status onto the backend error taxonomy.
fn classify_status(status: StatusCode, body: &Bytes) -> Result<(), BackendWriteError> {
    if status.is_success() {
        return Ok(());
    }
    let message = std::str::from_utf8(body)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map_or_else(|| format!("HTTP {status}"), |s| format!("HTTP {status}: {s}"));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(BackendWriteError::Transient(message))
    } else {
        Err(BackendWriteError::Permanent(message))
    }
}

#[async_trait]
impl BackendStore for HttpBackendStore {
    async fn get_agreement(
        &self,
        address: &Address,
    ) -> Result<Option<AgreementRecord>, BackendWriteError> {
        let url = self.url(&format!("/agreement/{address}"));
        let (status, bytes) = self.send(Method::GET, &url, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        classify_status(status, &bytes)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BackendWriteError::Permanent(format!("decoding agreement: {e}")))
    }

    async fn create_agreement(&self, record: &AgreementRecord) -> Result<(), BackendWriteError> {
        self.write(Method::POST, "/agreement", record).await
    }

    async fn update_status(
        &self,
        address: &Address,
        update: &StatusUpdate,
    ) -> Result<(), BackendWriteError> {
        self.write(Method::PUT, &format!("/agreement/{address}/status"), update)
            .await
    }

    async fn record_payment(
        &self,
        address: &Address,
        payment: &PaymentRecord,
    ) -> Result<(), BackendWriteError> {
        self.write(
            Method::POST,
            &format!("/agreement/{address}/payment"),
            payment,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let empty = Bytes::new();
        assert!(classify_status(StatusCode::OK, &empty).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT, &empty).is_ok());

        for transient in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(
                classify_status(transient, &empty),
                Err(BackendWriteError::Transient(_))
            ));
        }
        for permanent in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::CONFLICT,
        ] {
            assert!(matches!(
                classify_status(permanent, &empty),
                Err(BackendWriteError::Permanent(_))
            ));
        }
    }

    #[test]
    fn test_error_message_includes_body() {
        let err = classify_status(StatusCode::BAD_REQUEST, &Bytes::from("bad period")).unwrap_err();
        assert_eq!(
            err,
            BackendWriteError::Permanent("HTTP 400 Bad Request: bad period".to_string())
        );
    }

    #[test]
    fn test_session_token_is_redacted() {
        let token = SessionToken::new("super-secret");
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let store = HttpBackendStore::new("https://mirror.example.com/api/", None);
        assert_eq!(
            store.url("/agreement"),
            "https://mirror.example.com/api/agreement"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let store = HttpBackendStore::new("http://127.0.0.1:1", None);
        let address = Address::parse(&format!("0x{}", "ab".repeat(20))).unwrap();
        let err = store.get_agreement(&address).await.unwrap_err();
        assert!(matches!(err, BackendWriteError::Transient(_)));
    }
}
