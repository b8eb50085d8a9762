//! Turns user input into a [`Session`]: the forwarding target, the sources
//! and connections to serve, and a dispatcher endpoint to connect to.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ApiClient, ApiError, Connection, Source};
use crate::route::{ConnectionBinding, RouteTable};
use crate::transport::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("invalid URL {0}: {1}")]
    InvalidUrl(String, String),
    #[error("unsupported scheme {0}, expected http or https")]
    UnsupportedScheme(String),
    #[error("URL must include a host")]
    MissingHost,
    #[error("URL must not include a query string")]
    HasQuery,
}

/// Local base URL every inbound path is replayed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    url: Url,
}

impl ForwardTarget {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replace the base path.
    pub fn with_path(mut self, path: &str) -> Self {
        if path.starts_with('/') {
            self.url.set_path(path);
        } else {
            self.url.set_path(&format!("/{path}"));
        }
        self
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.url.fmt(f)
    }
}

impl FromStr for ForwardTarget {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let port = s.parse::<u16>().map_err(|_| TargetError::InvalidPort)?;
            if port == 0 {
                return Err(TargetError::InvalidPort);
            }
            let url = Url::parse(&format!("http://localhost:{port}/"))
                .map_err(|e| TargetError::InvalidUrl(s.to_string(), e.to_string()))?;
            return Ok(Self { url });
        }

        let raw = if s.contains("://") {
            s.to_string()
        } else {
            format!("http://{s}")
        };
        let mut url = Url::parse(&raw).map_err(|e| match e {
            url::ParseError::EmptyHost => TargetError::MissingHost,
            url::ParseError::InvalidPort => TargetError::InvalidPort,
            e => TargetError::InvalidUrl(s.to_string(), e.to_string()),
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TargetError::UnsupportedScheme(url.scheme().to_string()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(TargetError::MissingHost);
        }
        if url.query().is_some() {
            return Err(TargetError::HasQuery);
        }
        url.set_fragment(None);
        Ok(Self { url })
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Api(ApiError),
}

impl BootstrapError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, BootstrapError::Unauthenticated(_))
    }

    fn is_retryable(&self) -> bool {
        matches!(self, BootstrapError::Unavailable(_))
    }
}

impl From<ApiError> for BootstrapError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthenticated(message) => BootstrapError::Unauthenticated(message),
            ApiError::Conflict(message) => BootstrapError::Conflict(message),
            ApiError::Validation(message) => BootstrapError::Validation(message),
            ApiError::Unavailable(message) => BootstrapError::Unavailable(message),
            e => BootstrapError::Api(e),
        }
    }
}

/// How often a bootstrap is retried while the control plane is unavailable.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub target: ForwardTarget,
    /// Comma-separated source names; `None` or `*` selects every source.
    pub source_alias: Option<String>,
    pub connection_filter: Option<String>,
    pub device_name: String,
    /// Replaces scheme, host and port of the dispatcher URL.
    pub ws_base: Option<Url>,
    pub no_wss: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub websocket_url: String,
    pub dashboard_url: Option<String>,
    pub routes: RouteTable,
}

impl Session {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            session_id: self.id.clone(),
            token: self.token.clone(),
            url: self.websocket_url.clone(),
        }
    }
}

pub struct Bootstrapper {
    api: ApiClient,
    retry: RetryPolicy,
}

impl Bootstrapper {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve or create everything the session needs, retrying while the
    /// control plane is unavailable.
    ///
    /// Lookups reuse objects by name, so a retry after a partial run does not
    /// create duplicates.
    pub async fn bootstrap(&self, req: &BootstrapRequest) -> Result<Session, BootstrapError> {
        let mut delay = self.retry.initial;
        let mut attempt = 1;
        loop {
            match self.try_bootstrap(req).await {
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    warn!("Bootstrap attempt {} failed: {}, retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_bootstrap(&self, req: &BootstrapRequest) -> Result<Session, BootstrapError> {
        let sources = self.resolve_sources(req.source_alias.as_deref()).await?;

        let destination_name = format!("cli-{}", req.device_name);
        let destination = match self.api.find_destination(&destination_name).await? {
            Some(destination) => destination,
            None => {
                info!("Creating CLI destination {}", destination_name);
                self.api.create_cli_destination(&destination_name).await?
            }
        };

        let mut bindings = Vec::new();
        for source in &sources {
            let connections = self
                .resolve_connections(source, &destination.id, req.connection_filter.as_deref())
                .await?;
            bindings.extend(connections.into_iter().map(|c| ConnectionBinding {
                connection_id: c.id,
                connection_name: c.name,
                source_id: source.id.clone(),
                source_name: source.name.clone(),
                source_url: source.url.clone(),
            }));
        }
        if bindings.is_empty() {
            return Err(BootstrapError::Validation("no connections to listen on".into()));
        }

        let routes = RouteTable::build(&bindings, req.target.url());
        let descriptor = self
            .api
            .open_session(&req.device_name, &routes.connection_ids())
            .await?;
        let websocket_url = resolve_ws_url(&descriptor.websocket_url, req.ws_base.as_ref(), req.no_wss)?;
        debug!("Session {} will connect to {}", descriptor.id, websocket_url);

        Ok(Session {
            id: descriptor.id,
            token: descriptor.token,
            websocket_url,
            dashboard_url: descriptor.dashboard_url,
            routes,
        })
    }

    async fn resolve_sources(&self, alias: Option<&str>) -> Result<Vec<Source>, BootstrapError> {
        let names = match alias.map(str::trim) {
            None | Some("") | Some("*") => {
                let sources = self.api.list_sources(None).await?;
                if sources.is_empty() {
                    return Err(BootstrapError::Validation(
                        "the project has no sources, pass a source name to create one".into(),
                    ));
                }
                return Ok(sources);
            }
            Some(alias) => split_aliases(alias),
        };

        let mut sources = Vec::with_capacity(names.len());
        for name in names {
            let mut found: Vec<Source> = self
                .api
                .list_sources(Some(&name))
                .await?
                .into_iter()
                .filter(|s| s.name == name)
                .collect();
            let source = match found.len() {
                0 => {
                    info!("Creating source {}", name);
                    self.api.create_source(&name).await?
                }
                1 => found.remove(0),
                n => {
                    return Err(BootstrapError::Conflict(format!(
                        "source name {name} matches {n} sources"
                    )));
                }
            };
            sources.push(source);
        }
        Ok(sources)
    }

    async fn resolve_connections(
        &self,
        source: &Source,
        destination_id: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Connection>, BootstrapError> {
        let existing = self.api.list_connections(&source.id, destination_id).await?;
        let (matching, name) = match filter {
            Some(filter) => (
                existing.into_iter().filter(|c| c.name == filter).collect::<Vec<_>>(),
                filter.to_string(),
            ),
            None => (existing, format!("{}-cli", source.name)),
        };
        if !matching.is_empty() {
            return Ok(matching);
        }
        info!("Creating connection {} for source {}", name, source.name);
        let created = self
            .api
            .create_connection(&name, &source.id, destination_id)
            .await?;
        Ok(vec![created])
    }
}

fn split_aliases(alias: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in alias.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Dispatcher URL after applying the endpoint override and the `ws://`
/// downgrade.
fn resolve_ws_url(raw: &str, ws_base: Option<&Url>, no_wss: bool) -> Result<String, BootstrapError> {
    let invalid = |reason: String| BootstrapError::Validation(format!("invalid websocket URL {raw}: {reason}"));
    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    if let Some(base) = ws_base {
        url.set_scheme(base.scheme())
            .map_err(|_| invalid(format!("cannot use scheme {}", base.scheme())))?;
        url.set_host(base.host_str()).map_err(|e| invalid(e.to_string()))?;
        url.set_port(base.port())
            .map_err(|_| invalid("cannot set port".into()))?;
    }

    let scheme = match url.scheme() {
        "https" | "wss" if !no_wss => "wss",
        "https" | "wss" | "http" | "ws" => "ws",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot use scheme {scheme}")))?;
    Ok(url.to_string())
}

/// Stable name for this machine and user, used to key the CLI destination.
pub fn device_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".into());
    sanitize_device_name(&user, &host)
}

fn sanitize_device_name(user: &str, host: &str) -> String {
    let mut name = String::new();
    for c in format!("{user}-{host}").chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    name.trim_matches('-').to_string()
}
