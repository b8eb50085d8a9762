//! Listen command - forwards webhook deliveries to a local server.

use std::path::PathBuf;
use std::time::Duration;

use hookrelay::api::{ApiClient, ApiError, DEFAULT_API_BASE};
use hookrelay::pipeline::PipelineConfig;
use hookrelay::session::{BootstrapError, BootstrapRequest, Bootstrapper, ForwardTarget, TargetError, device_name};
use hookrelay::transport::TransportConfig;
use tracing::info;
use url::Url;

use crate::config::{Config, ConfigError, Credentials, ProfileConfig};
use crate::supervisor::{Settings, Summary, Supervisor, print_summary};
use crate::ui::{Header, Mode};

const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
const RESULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Forward webhook deliveries to a local server
#[derive(Debug, clap::Args)]
pub struct Args {
    /// Local port (e.g. 3000) or base URL (e.g. http://localhost:3000/api)
    target: String,

    /// Source name, a comma-separated list of names, or `*` for every source
    source: Option<String>,

    /// Only use connections with this name, creating it if needed
    connection: Option<String>,

    /// Override the dispatcher websocket endpoint
    #[arg(long, hide = true)]
    ws_base: Option<Url>,

    /// Use ws:// instead of wss://
    #[arg(long, hide = true)]
    no_wss: bool,

    /// Override the control-plane API base URL
    #[arg(long, hide = true)]
    api_base: Option<String>,

    /// Path prefix every delivery is forwarded under
    #[arg(long)]
    path: Option<String>,

    /// Seconds to wait for the local server before giving up on a delivery
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Largest local response body reported back, in bytes
    #[arg(long, value_name = "BYTES")]
    max_body: Option<usize>,

    /// Print one line per delivery instead of the full-screen view
    #[arg(long)]
    pub no_ui: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("invalid target: {0}")]
    Target(#[from] TargetError),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("not logged in to profile '{0}'")]
    NotLoggedIn(String),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("session could not be renewed: {0}")]
    ReauthRequired(String),

    #[error("interrupted again before in-flight deliveries finished")]
    Interrupted,

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl ListenError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ListenError::Runtime(_) | ListenError::Interrupted => 1,
            ListenError::Target(_) | ListenError::Usage(_) | ListenError::Config(_) => 2,
            ListenError::Bootstrap(e) if e.is_unauthenticated() => 3,
            ListenError::Bootstrap(_) => 2,
            ListenError::NotLoggedIn(_) | ListenError::ReauthRequired(_) => 3,
        }
    }

    /// Next step suggested to the user, if any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ListenError::NotLoggedIn(_) | ListenError::ReauthRequired(_) => {
                Some("Run 'hookrelay login' to authenticate.")
            }
            ListenError::Bootstrap(e) if e.is_unauthenticated() => {
                Some("Your API key was rejected. Run 'hookrelay login' to authenticate again.")
            }
            ListenError::Bootstrap(BootstrapError::Unavailable(_)) => {
                Some("Check your network connection and try again.")
            }
            ListenError::Target(_) => Some("Pass a port such as 3000 or a URL such as http://localhost:3000."),
            _ => None,
        }
    }
}

pub struct Globals<'a> {
    pub profile: &'a str,
    pub credentials: Option<PathBuf>,
    pub mode: Mode,
}

pub async fn execute(args: &Args, globals: &Globals<'_>) -> Result<Summary, ListenError> {
    let mut target: ForwardTarget = args.target.parse()?;
    if let Some(path) = &args.path {
        target = target.with_path(path);
    }

    let config = Config::load()?;
    let profile_config = config.resolve_profile(globals.profile)?;

    let credentials_path = match &globals.credentials {
        Some(path) => path.clone(),
        None => Credentials::path().ok_or(ConfigError::NoConfigDir)?,
    };
    let credentials = match Credentials::load_from(&credentials_path) {
        Ok(credentials) => credentials,
        Err(ConfigError::Read { .. }) => return Err(ListenError::NotLoggedIn(globals.profile.to_string())),
        Err(e) => return Err(e.into()),
    };
    let creds = credentials
        .get_profile(globals.profile)
        .ok_or_else(|| ListenError::NotLoggedIn(globals.profile.to_string()))?;

    let api_base = args
        .api_base
        .clone()
        .or_else(|| profile_config.api_base.clone())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let ws_base = match &args.ws_base {
        Some(url) => Some(url.clone()),
        None => profile_config
            .ws_base
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| ListenError::Usage(format!("invalid ws_base in config: {e}")))?,
    };
    let api = ApiClient::new(&api_base, &creds.api_key).map_err(|e| match e {
        ApiError::Client(e) => ListenError::Runtime(e.into()),
        e => ListenError::Bootstrap(e.into()),
    })?;

    let request = BootstrapRequest {
        target,
        source_alias: args.source.clone(),
        connection_filter: args.connection.clone(),
        device_name: device_name(),
        ws_base,
        no_wss: args.no_wss,
    };
    let bootstrapper = Bootstrapper::new(api.clone());
    info!("Starting session for profile '{}' against {}", globals.profile, api_base);
    let session = bootstrapper.bootstrap(&request).await?;

    let settings = settings(args, &profile_config);
    let header = Header {
        user: creds.user.clone(),
        project: creds.project.clone(),
        version: env!("CARGO_PKG_VERSION"),
        dashboard_url: session
            .dashboard_url
            .clone()
            .or_else(|| profile_config.dashboard_base.clone()),
    };

    let supervisor = Supervisor {
        bootstrapper,
        request,
        api,
        settings,
        mode: globals.mode,
        header,
    };
    let summary = supervisor.run(session).await?;
    print_summary(&summary);
    Ok(summary)
}

/// Flag, then profile, then built-in default.
fn settings(args: &Args, profile: &ProfileConfig) -> Settings {
    let defaults = PipelineConfig::default();
    let drain_deadline = profile
        .drain_deadline_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.drain_deadline);
    let pipeline = PipelineConfig {
        workers: profile.workers.unwrap_or(defaults.workers).max(1),
        queue_capacity: profile.queue_capacity.unwrap_or(defaults.queue_capacity).max(1),
        request_timeout: args
            .timeout
            .or(profile.request_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout),
        max_body_bytes: args
            .max_body
            .or(profile.max_body_bytes)
            .unwrap_or(defaults.max_body_bytes),
        drain_deadline,
    };
    let transport = TransportConfig {
        drain_deadline,
        ..TransportConfig::default()
    };
    Settings {
        pipeline,
        transport,
        outbound_capacity: profile.outbound_capacity.unwrap_or(DEFAULT_OUTBOUND_CAPACITY),
        result_queue_timeout: RESULT_QUEUE_TIMEOUT,
    }
}
