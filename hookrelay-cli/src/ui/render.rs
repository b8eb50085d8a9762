use std::sync::Arc;

use hookrelay::attempt::StatusBucket;
use hookrelay::event::{Phase, TransportState};
use hookrelay::route::Route;
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap};

use super::history::{History, HistoryEntry};
use super::{Header, body_preview};

const KEYS_HELP: &str = "↑/↓ select  r retry  o open dashboard  d body  q quit";

/// Everything one frame shows.
pub struct View<'a> {
    pub header: &'a Header,
    pub state: &'a TransportState,
    pub routes: &'a [Arc<Route>],
    pub history: &'a History,
    pub preview: bool,
    pub notice: Option<&'a str>,
    pub quitting: bool,
}

pub fn draw(f: &mut Frame, view: &View) {
    let source_rows = (view.routes.len().max(1) as u16).saturating_add(2).min(8);
    let mut constraints = vec![
        Constraint::Length(3),
        Constraint::Length(source_rows),
        Constraint::Min(5),
    ];
    if view.preview {
        constraints.push(Constraint::Length(10));
    }
    constraints.push(Constraint::Length(1));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(f.area());

    draw_header(f, view, chunks[0]);
    draw_sources(f, view, chunks[1]);
    draw_history(f, view, chunks[2]);
    if view.preview {
        draw_preview(f, view, chunks[3]);
    }
    draw_footer(f, view, chunks[chunks.len() - 1]);
}

fn draw_header(f: &mut Frame, view: &View, area: Rect) {
    let identity = match (&view.header.user, &view.header.project) {
        (Some(user), Some(project)) => format!("{user} @ {project}"),
        (Some(user), None) => user.clone(),
        (None, Some(project)) => project.clone(),
        (None, None) => "hookrelay".to_string(),
    };
    let status_style = match view.state.phase {
        Phase::Open => Style::default().fg(Color::Green),
        Phase::Draining => Style::default().fg(Color::Yellow),
        _ => Style::default().fg(Color::Red),
    };
    let status = if view.quitting {
        "Shutting down, finishing in-flight deliveries… (q again to skip)".to_string()
    } else {
        view.state.to_string()
    };
    let line = Line::from(vec![
        Span::styled(identity, Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  "),
        Span::styled(status, status_style),
        Span::raw(format!("  v{}", view.header.version)),
    ]);
    let header = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("hookrelay"));
    f.render_widget(header, area);
}

fn draw_sources(f: &mut Frame, view: &View, area: Rect) {
    let items: Vec<ListItem> = if view.routes.is_empty() {
        vec![ListItem::new("No connections")]
    } else {
        view.routes
            .iter()
            .map(|route| {
                ListItem::new(Line::from(vec![
                    Span::styled(route.source_name.clone(), Style::default().add_modifier(Modifier::BOLD)),
                    Span::raw("  "),
                    Span::raw(route.source_url.clone().unwrap_or_else(|| "-".to_string())),
                    Span::raw(" → "),
                    Span::styled(route.local.to_string(), Style::default().fg(Color::Cyan)),
                ]))
            })
            .collect()
    };
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Sources"));
    f.render_widget(list, area);
}

fn draw_history(f: &mut Frame, view: &View, area: Rect) {
    let items: Vec<ListItem> = view.history.iter().map(history_item).collect();
    let title = format!("Deliveries ({})", view.history.len());
    let mut state = ListState::default();
    state.select(view.history.selected_index());

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::BOLD | Modifier::REVERSED))
        .highlight_symbol("> ");
    f.render_stateful_widget(list, area, &mut state);
}

fn history_item(entry: &HistoryEntry) -> ListItem<'static> {
    let delivery = &entry.delivery;
    let result = &delivery.result;
    let bucket = result.bucket();
    let color = match bucket {
        StatusBucket::Success => Color::Green,
        StatusBucket::Redirect | StatusBucket::Informational => Color::Cyan,
        StatusBucket::ClientError => Color::Yellow,
        StatusBucket::ServerError | StatusBucket::Failed => Color::Red,
    };
    let outcome = match (result.status, result.error) {
        (_, Some(class)) => class.to_string(),
        (Some(status), None) => status.to_string(),
        (None, None) => "-".to_string(),
    };

    let mut spans = vec![
        Span::raw(result.finished_at.format("%H:%M:%S ").to_string()),
        Span::styled(format!("{outcome:>13} "), Style::default().fg(color)),
        Span::raw(format!("{} {} ", delivery.method, delivery.path)),
        Span::styled(delivery.source_name.clone(), Style::default().add_modifier(Modifier::DIM)),
        Span::raw(format!(" {}ms", result.elapsed.as_millis())),
    ];
    if entry.unreported {
        spans.push(Span::styled(" unreported", Style::default().fg(Color::Red)));
    }
    ListItem::new(Line::from(spans))
}

fn draw_preview(f: &mut Frame, view: &View, area: Rect) {
    let (title, text) = match view.history.selected() {
        Some(entry) => {
            let result = &entry.delivery.result;
            let title = match &result.reason {
                Some(reason) => format!("{} ({})", result.attempt_id, reason),
                None => result.attempt_id.clone(),
            };
            (title, body_preview(result))
        }
        None => ("Body".to_string(), String::new()),
    };
    let preview = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    f.render_widget(preview, area);
}

fn draw_footer(f: &mut Frame, view: &View, area: Rect) {
    let line = match view.notice {
        Some(notice) => Line::from(Span::styled(notice.to_string(), Style::default().fg(Color::Yellow))),
        None => Line::from(Span::styled(KEYS_HELP, Style::default().add_modifier(Modifier::DIM))),
    };
    f.render_widget(Paragraph::new(line), area);
}
