//! Full-screen status view.

use std::io;
use std::time::Duration;

use crossterm::event::{Event as TermEvent, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use hookrelay::event::{Event, Subscription};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Header, UiContext};
use super::guard::TerminalGuard;
use super::history::History;
use super::render::{View, draw};

/// ~15 frames per second.
const REDRAW_INTERVAL: Duration = Duration::from_millis(66);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Up,
    Down,
    Retry,
    Open,
    TogglePreview,
    Quit,
}

fn action_for(key: &KeyEvent) -> Action {
    if key.kind != KeyEventKind::Press {
        return Action::None;
    }
    match key.code {
        KeyCode::Up => Action::Up,
        KeyCode::Down => Action::Down,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Action::Quit,
        KeyCode::Char('r') => Action::Retry,
        KeyCode::Char('o') => Action::Open,
        KeyCode::Char('d') => Action::TogglePreview,
        KeyCode::Char('q') => Action::Quit,
        _ => Action::None,
    }
}

pub async fn run(ctx: &UiContext, sub: &mut Subscription) -> io::Result<()> {
    let guard = TerminalGuard::enter()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
    terminal.clear()?;

    let mut keys = EventStream::new();
    let mut redraw = tokio::time::interval(REDRAW_INTERVAL);
    redraw.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Outcomes of background actions (retry requests) land here.
    let (notice_tx, mut notices) = mpsc::unbounded_channel::<String>();

    let mut history = History::default().with_dashboard(ctx.header.dashboard_url.as_deref());
    let mut notice: Option<String> = None;
    let mut preview = false;
    let mut events_open = true;
    let mut keys_open = true;

    loop {
        tokio::select! {
            _ = ctx.done.cancelled() => break,
            event = sub.events.recv(), if events_open => match event {
                Ok(Event::Delivery(delivery)) => history.push(delivery),
                Ok(Event::Unreported { attempt_id }) => {
                    history.mark_unreported(&attempt_id);
                }
                Ok(Event::Notice(message)) => notice = Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("UI skipped {} events", skipped);
                }
                Err(RecvError::Closed) => events_open = false,
            },
            Some(message) = notices.recv() => notice = Some(message),
            key = keys.next(), if keys_open => match key {
                Some(Ok(TermEvent::Key(key))) => match action_for(&key) {
                    Action::None => {}
                    Action::Up => history.select_previous(),
                    Action::Down => history.select_next(),
                    Action::TogglePreview => preview = !preview,
                    Action::Quit => quit(&ctx.cancel, &ctx.force),
                    Action::Retry => notice = Some(request_retry(ctx, &history, &notice_tx)),
                    Action::Open => notice = open_dashboard(&ctx.header, &history),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => keys_open = false,
            },
            _ = redraw.tick() => {
                let state = sub.state.borrow().clone();
                let routes = ctx.routes.borrow().sorted();
                let quitting = ctx.cancel.is_cancelled();
                terminal.draw(|f| {
                    draw(f, &View {
                        header: &ctx.header,
                        state: &state,
                        routes: &routes,
                        history: &history,
                        preview,
                        notice: notice.as_deref(),
                        quitting,
                    })
                })?;
            }
        }
    }

    drop(guard);
    let unreported = history.unreported_count();
    if unreported > 0 {
        warn!("{} deliveries in this view were never reported", unreported);
    }
    Ok(())
}

fn request_retry(ctx: &UiContext, history: &History, notices: &mpsc::UnboundedSender<String>) -> String {
    let Some(entry) = history.selected() else {
        return "Nothing selected".to_string();
    };
    let attempt_id = entry.delivery.result.attempt_id.clone();
    let api = ctx.api.clone();
    let notices = notices.clone();
    tokio::spawn(async move {
        let message = match api.retry_attempt(&attempt_id).await {
            Ok(()) => format!("Retry requested for {attempt_id}"),
            Err(e) => format!("Retry of {attempt_id} failed: {e}"),
        };
        let _ = notices.send(message);
    });
    "Requesting retry…".to_string()
}

/// The first quit starts the drain, the next one skips it.
fn quit(cancel: &CancellationToken, force: &CancellationToken) {
    if cancel.is_cancelled() {
        force.cancel();
    } else {
        cancel.cancel();
    }
}

/// The selected delivery's page, or the session dashboard while nothing is selected.
fn dashboard_target<'a>(header: &'a Header, history: &'a History) -> Option<&'a str> {
    match history.selected() {
        Some(entry) => entry.link.as_deref(),
        None => header.dashboard_url.as_deref(),
    }
}

fn open_dashboard(header: &Header, history: &History) -> Option<String> {
    let Some(url) = dashboard_target(header, history) else {
        return Some("No dashboard link for this session".to_string());
    };
    match open::that(url) {
        Ok(()) => None,
        Err(e) => Some(format!("Could not open {url}: {e}")),
    }
}
