//! Line-per-delivery output for pipes, CI and `--no-ui`.

use std::io::Write;

use hookrelay::event::{Delivery, Event, Subscription};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn run<W: Write>(sub: &mut Subscription, done: &CancellationToken, mut out: W) {
    let mut last_status = sub.state.borrow_and_update().to_string();
    let _ = writeln!(out, "{last_status}");
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            event = sub.events.recv(), if events_open => match event {
                Ok(event) => write_event(&mut out, &event),
                Err(RecvError::Lagged(skipped)) => warn!("Status output fell behind, {} events skipped", skipped),
                Err(RecvError::Closed) => events_open = false,
            },
            changed = sub.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = sub.state.borrow_and_update().to_string();
                if status != last_status {
                    let _ = writeln!(out, "{status}");
                    last_status = status;
                }
            }
        }
        let _ = out.flush();
    }

    // Deliveries finalized during the drain may still be queued.
    while let Ok(event) = sub.events.try_recv() {
        write_event(&mut out, &event);
    }
    let _ = out.flush();
}

fn write_event<W: Write>(out: &mut W, event: &Event) {
    let _ = match event {
        Event::Delivery(delivery) => writeln!(out, "{}", format_delivery(delivery)),
        Event::Unreported { attempt_id } => writeln!(out, "attempt={attempt_id} unreported"),
        Event::Notice(message) => writeln!(out, "{message}"),
    };
}

pub fn format_delivery(delivery: &Delivery) -> String {
    let result = &delivery.result;
    let mut line = format!(
        "{} source={} {} {}",
        result.finished_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        delivery.source_name,
        delivery.method,
        delivery.path,
    );
    match (result.status, result.error) {
        (_, Some(class)) => line.push_str(&format!(" error={class}")),
        (Some(status), None) => line.push_str(&format!(" status={status}")),
        (None, None) => {}
    }
    if let Some(reason) = &result.reason {
        line.push_str(&format!(" reason={reason:?}"));
    }
    line.push_str(&format!(" elapsed={}ms", result.elapsed.as_millis()));
    if result.truncated {
        line.push_str(" truncated");
    }
    if let Some(local) = &delivery.local_url {
        line.push_str(&format!(" local={local}"));
    }
    line.push_str(&format!(" attempt={}", result.attempt_id));
    line
}
