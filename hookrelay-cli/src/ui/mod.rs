//! Status UI: a full-screen view on a terminal, plain lines everywhere else.
//!
//! Either mode is just another subscriber of the core's event bus; nothing
//! here sits on the delivery path.

mod guard;
mod history;
mod interactive;
mod log;
mod render;

use std::sync::Arc;

use crossterm::tty::IsTty;
use hookrelay::api::ApiClient;
use hookrelay::attempt::AttemptResult;
use hookrelay::event::Subscription;
use hookrelay::route::RouteTable;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Interactive,
    Log,
}

impl Mode {
    pub fn detect(no_ui: bool) -> Self {
        if no_ui || !std::io::stdout().is_tty() {
            return Mode::Log;
        }
        match std::env::var("TERM") {
            Ok(term) if term == "dumb" => Mode::Log,
            _ => Mode::Interactive,
        }
    }
}

/// Static facts shown at the top of the interactive view.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub user: Option<String>,
    pub project: Option<String>,
    pub version: &'static str,
    pub dashboard_url: Option<String>,
}

/// What the UI needs besides the event stream.
pub struct UiContext {
    pub header: Header,
    pub routes: watch::Receiver<Arc<RouteTable>>,
    /// Used for the retry binding.
    pub api: ApiClient,
    /// Cancelled when the user quits.
    pub cancel: CancellationToken,
    /// Cancelled when the user quits a second time, skipping the drain.
    pub force: CancellationToken,
    /// Cancelled by the supervisor once the core has shut down.
    pub done: CancellationToken,
}

/// Run the UI until `ctx.done` fires. A failing terminal drops to log mode once.
pub async fn run(mode: Mode, ctx: UiContext, mut sub: Subscription) {
    if mode == Mode::Interactive {
        match interactive::run(&ctx, &mut sub).await {
            Ok(()) => return,
            Err(e) => warn!("Terminal UI failed, switching to log output: {}", e),
        }
    }
    log::run(&mut sub, &ctx.done, std::io::stdout()).await;
}

/// Response body as shown by the preview pane.
pub fn body_preview(result: &AttemptResult) -> String {
    if result.body.is_empty() {
        return "(empty body)".to_string();
    }
    let textual = match result.header("content-type") {
        Some(value) => value.parse::<mime::Mime>().is_ok_and(|m| is_textual(&m)),
        None => std::str::from_utf8(&result.body).is_ok(),
    };
    if !textual {
        return format!("({} bytes of binary data)", result.body.len());
    }
    let mut text = String::from_utf8_lossy(&result.body).into_owned();
    if result.truncated {
        text.push_str("\n(truncated)");
    }
    text
}

fn is_textual(m: &mime::Mime) -> bool {
    m.type_() == mime::TEXT
        || m.subtype() == mime::JSON
        || m.subtype() == mime::XML
        || m.suffix() == Some(mime::JSON)
        || m.suffix() == Some(mime::XML)
        || m.subtype() == mime::WWW_FORM_URLENCODED
        || m.subtype() == mime::JAVASCRIPT
}
