//! Client for the handful of control-plane endpoints the listener needs.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use reqwest_hickory_resolver::HickoryResolver;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::transport::message::AttemptResultFrame;

pub const DEFAULT_API_BASE: &str = "https://api.hookrelay.dev/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected by the control plane: {0}")]
    Validation(String),
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected response {status}: {message}")]
    Unexpected { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid API base URL {0:?}")]
    InvalidBase(String),
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
}

impl ApiError {
    /// Worth retrying after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Unavailable(_))
    }

    fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => ApiError::Unauthenticated(message),
            409 => ApiError::Conflict(message),
            400 | 422 => ApiError::Validation(message),
            500..=599 => ApiError::Unavailable(format!("{status}: {message}")),
            code => ApiError::Unexpected {
                status: code,
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Destination {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub source_id: String,
    pub destination_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub token: String,
    pub websocket_url: String,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    models: Vec<T>,
}

/// Error body
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[allow(dead_code)]
    code: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateSource<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateDestination<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    cli_path: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateConnection<'a> {
    name: &'a str,
    source_id: &'a str,
    destination_id: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenSession<'a> {
    device_name: &'a str,
    connection_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct Ignored {}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
}

impl ApiClient {
    pub fn new(base: &str, api_key: &str) -> Result<Self, ApiError> {
        let base = base.trim_end_matches('/');
        let parsed = Url::parse(base).map_err(|_| ApiError::InvalidBase(base.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::InvalidBase(base.to_string()));
        }
        let resolver = Arc::new(HickoryResolver::default());
        let http = reqwest::Client::builder()
            .dns_resolver(resolver)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hookrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            http,
            base: parsed,
            api_key: api_key.to_string(),
        })
    }

    pub fn base(&self) -> &str {
        self.base.as_str()
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Sources, optionally narrowed to an exact name.
    pub async fn list_sources(&self, name: Option<&str>) -> Result<Vec<Source>, ApiError> {
        let query: Vec<(&str, &str)> = name.map(|n| vec![("name", n)]).unwrap_or_default();
        let list: ListResponse<Source> = self.call(Method::GET, &["sources"], &query, None::<&()>).await?;
        Ok(list.models)
    }

    pub async fn create_source(&self, name: &str) -> Result<Source, ApiError> {
        self.call(Method::POST, &["sources"], &[], Some(&CreateSource { name }))
            .await
    }

    pub async fn find_destination(&self, name: &str) -> Result<Option<Destination>, ApiError> {
        let list: ListResponse<Destination> = self
            .call(Method::GET, &["destinations"], &[("name", name)], None::<&()>)
            .await?;
        Ok(list.models.into_iter().find(|d| d.name == name))
    }

    pub async fn create_cli_destination(&self, name: &str) -> Result<Destination, ApiError> {
        let body = CreateDestination {
            name,
            kind: "CLI",
            cli_path: "/",
        };
        self.call(Method::POST, &["destinations"], &[], Some(&body)).await
    }

    pub async fn list_connections(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Vec<Connection>, ApiError> {
        let query = [("source_id", source_id), ("destination_id", destination_id)];
        let list: ListResponse<Connection> = self
            .call(Method::GET, &["connections"], &query, None::<&()>)
            .await?;
        Ok(list.models)
    }

    pub async fn create_connection(
        &self,
        name: &str,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Connection, ApiError> {
        let body = CreateConnection {
            name,
            source_id,
            destination_id,
        };
        self.call(Method::POST, &["connections"], &[], Some(&body)).await
    }

    /// Exchange the API key for a short-lived session over `connection_ids`.
    pub async fn open_session(
        &self,
        device_name: &str,
        connection_ids: &[String],
    ) -> Result<SessionDescriptor, ApiError> {
        let body = OpenSession {
            device_name,
            connection_ids,
        };
        self.call(Method::POST, &["cli-sessions"], &[], Some(&body)).await
    }

    /// Report a result over HTTP when the websocket could not carry it.
    pub async fn submit_attempt_result(&self, result: &AttemptResultFrame) -> Result<(), ApiError> {
        let path = ["attempts", result.attempt_id.as_str(), "result"];
        let _: Option<Ignored> = self.call_optional(Method::POST, &path, Some(result)).await?;
        Ok(())
    }

    /// Ask the control plane to deliver an attempt again.
    pub async fn retry_attempt(&self, attempt_id: &str) -> Result<(), ApiError> {
        let path = ["attempts", attempt_id, "retry"];
        let _: Option<Ignored> = self.call_optional(Method::POST, &path, None::<&()>).await?;
        Ok(())
    }

    async fn call<B, T>(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(method, path, query, body).await?;
        response.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Like [`Self::call`] but tolerates an empty success body.
    async fn call_optional<B, T>(
        &self,
        method: Method,
        path: &[&str],
        body: Option<&B>,
    ) -> Result<Option<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(method, path, &[], body).await?;
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path);
        debug!("{} {}", method, url);

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or_else(|_| if text.is_empty() { status.to_string() } else { text });
        Err(ApiError::from_status(status, message))
    }
}
