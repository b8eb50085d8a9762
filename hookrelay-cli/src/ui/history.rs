//! Bounded delivery history shown in the interactive view.

use std::collections::VecDeque;
use std::sync::Arc;

use hookrelay::event::Delivery;
use url::Url;

pub const HISTORY_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub delivery: Arc<Delivery>,
    /// The result never reached the dispatcher.
    pub unreported: bool,
    /// Dashboard page for this delivery.
    pub link: Option<String>,
}

/// `<dashboard>/events/<event id>`, or `<dashboard>/attempts/<attempt id>`
/// when the attempt carries no event id.
pub fn entry_link(dashboard: &Url, delivery: &Delivery) -> Option<String> {
    let mut url = dashboard.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        match delivery.event_id.as_deref() {
            Some(event_id) => segments.extend(["events", event_id]),
            None => segments.extend(["attempts", delivery.result.attempt_id.as_str()]),
        };
    }
    Some(url.to_string())
}

/// FIFO of the most recent deliveries, oldest first.
///
/// The selection either follows the newest entry or stays pinned to the
/// entry the user scrolled to, surviving evictions at the front.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    /// `None` follows the tail.
    pinned: Option<usize>,
    dashboard: Option<Url>,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            pinned: None,
            dashboard: None,
        }
    }

    /// Link new entries under the session's dashboard URL.
    pub fn with_dashboard(mut self, dashboard: Option<&str>) -> Self {
        self.dashboard = dashboard.and_then(|d| Url::parse(d).ok());
        self
    }

    pub fn push(&mut self, delivery: Arc<Delivery>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            if let Some(index) = self.pinned.as_mut() {
                *index = index.saturating_sub(1);
            }
        }
        let link = self.dashboard.as_ref().and_then(|d| entry_link(d, &delivery));
        self.entries.push_back(HistoryEntry {
            delivery,
            unreported: false,
            link,
        });
    }

    pub fn mark_unreported(&mut self, attempt_id: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.delivery.result.attempt_id == attempt_id)
        {
            Some(entry) => {
                entry.unreported = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn selected_index(&self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.pinned.unwrap_or(self.entries.len() - 1))
    }

    pub fn selected(&self) -> Option<&HistoryEntry> {
        self.selected_index().and_then(|i| self.entries.get(i))
    }

    pub fn select_previous(&mut self) {
        if let Some(index) = self.selected_index() {
            self.pinned = Some(index.saturating_sub(1));
        }
    }

    pub fn select_next(&mut self) {
        let Some(index) = self.selected_index() else {
            return;
        };
        self.pinned = if index + 1 >= self.entries.len() - 1 {
            None
        } else {
            Some(index + 1)
        };
    }

    pub fn unreported_count(&self) -> usize {
        self.entries.iter().filter(|e| e.unreported).count()
    }
}
