//! Character discovery.
//!
//! Characters are revealed as the reader reaches their first appearance. The
//! discovered set only grows and survives reloads through
//! [`CharacterHistory`].

mod toast;

pub use toast::{ToastAction, ToastQueue, ToastSnapshot};

use crate::error::ServiceError;
use crate::model::CharacterRecord;
use crate::storage::CharacterHistory;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub debounce: Duration,
    pub toast_duration: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    ScheduleDebounce {
        seq: u64,
        delay: Duration,
    },
    FetchUpTo {
        request_id: u64,
        chapter_index: usize,
        paragraph_index: usize,
    },
    FetchSince {
        request_id: u64,
        since_unix_ms: u64,
    },
    SchedulePoll {
        delay: Duration,
    },
    /// The history changed and should be written to the store.
    Persist,
    Discovered(Vec<CharacterRecord>),
    Toast(ToastAction),
}

pub struct CharacterTracker {
    config: TrackerConfig,
    enabled: bool,
    history: CharacterHistory,
    position: (usize, usize),
    debounce_seq: u64,
    request_seq: u64,
    up_to_in_flight: Option<(u64, (usize, usize))>,
    since_in_flight: Option<u64>,
    poll_armed: bool,
    toasts: ToastQueue,
}

impl CharacterTracker {
    pub fn new(config: TrackerConfig, history: CharacterHistory) -> Self {
        let toasts = ToastQueue::new(config.toast_duration);
        Self {
            config,
            enabled: false,
            history,
            position: (0, 0),
            debounce_seq: 0,
            request_seq: 0,
            up_to_in_flight: None,
            since_in_flight: None,
            poll_armed: false,
            toasts,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn history(&self) -> &CharacterHistory {
        &self.history
    }

    pub fn toasts(&self) -> ToastSnapshot {
        self.toasts.snapshot()
    }

    pub fn is_discovered(&self, id: &str) -> bool {
        self.history.discovered.iter().any(|known| known == id)
    }

    /// The cursor settled somewhere; restart the debounce window.
    pub fn cursor_settled(&mut self, chapter_index: usize, paragraph_index: usize) -> Vec<TrackerAction> {
        if !self.enabled {
            return Vec::new();
        }
        self.position = (chapter_index, paragraph_index);
        self.debounce_seq = self.debounce_seq.wrapping_add(1);
        vec![TrackerAction::ScheduleDebounce {
            seq: self.debounce_seq,
            delay: self.config.debounce,
        }]
    }

    pub fn on_debounce(&mut self, seq: u64) -> Vec<TrackerAction> {
        if seq != self.debounce_seq || !self.enabled {
            return Vec::new();
        }
        self.request_seq = self.request_seq.wrapping_add(1);
        let request_id = self.request_seq;
        let (chapter_index, paragraph_index) = self.position;
        self.up_to_in_flight = Some((request_id, self.position));
        debug!(chapter_index, paragraph_index, request_id, "Requesting characters up to position");
        vec![TrackerAction::FetchUpTo {
            request_id,
            chapter_index,
            paragraph_index,
        }]
    }

    pub fn on_up_to(
        &mut self,
        request_id: u64,
        result: Result<Vec<CharacterRecord>, ServiceError>,
    ) -> Vec<TrackerAction> {
        let Some((expected, position)) = self.up_to_in_flight else {
            debug!(request_id, "Ignoring unexpected character listing");
            return Vec::new();
        };
        if expected != request_id {
            debug!(request_id, expected, "Ignoring stale character listing");
            return Vec::new();
        }
        self.up_to_in_flight = None;
        if position != self.position {
            debug!(request_id, "Cursor moved since request; discarding character listing");
            return Vec::new();
        }
        let mut actions = match result {
            Ok(records) => self.absorb(records),
            Err(err) => {
                warn!(request_id, "Character listing failed: {err}");
                Vec::new()
            }
        };
        actions.extend(self.start_polling());
        actions
    }

    /// Arm the book-scoped "new since" poll if it is not running.
    pub fn start_polling(&mut self) -> Vec<TrackerAction> {
        if !self.enabled || self.poll_armed || self.since_in_flight.is_some() {
            return Vec::new();
        }
        self.poll_armed = true;
        vec![TrackerAction::SchedulePoll {
            delay: self.config.poll_interval,
        }]
    }

    pub fn on_poll_tick(&mut self) -> Vec<TrackerAction> {
        self.poll_armed = false;
        if !self.enabled || self.since_in_flight.is_some() {
            return Vec::new();
        }
        self.request_seq = self.request_seq.wrapping_add(1);
        let request_id = self.request_seq;
        self.since_in_flight = Some(request_id);
        vec![TrackerAction::FetchSince {
            request_id,
            since_unix_ms: self.history.last_checked_unix_ms,
        }]
    }

    pub fn on_since(
        &mut self,
        request_id: u64,
        result: Result<Vec<CharacterRecord>, ServiceError>,
        now_unix_ms: u64,
    ) -> Vec<TrackerAction> {
        if self.since_in_flight != Some(request_id) {
            debug!(request_id, "Ignoring stale new-character poll");
            return Vec::new();
        }
        self.since_in_flight = None;
        let mut actions = match result {
            Ok(records) => {
                self.history.last_checked_unix_ms = now_unix_ms;
                let mut actions = self.absorb(records);
                if !actions.contains(&TrackerAction::Persist) {
                    actions.push(TrackerAction::Persist);
                }
                actions
            }
            Err(err) => {
                warn!(request_id, "New-character poll failed: {err}");
                Vec::new()
            }
        };
        actions.extend(self.start_polling());
        actions
    }

    pub fn dismiss_toast(&mut self) -> Vec<TrackerAction> {
        wrap_toasts(self.toasts.dismiss())
    }

    pub fn on_toast_timer(&mut self, generation: u64) -> Vec<TrackerAction> {
        wrap_toasts(self.toasts.on_dismiss_timer(generation))
    }

    pub fn clear_toasts(&mut self) -> Vec<TrackerAction> {
        wrap_toasts(self.toasts.clear())
    }

    /// Merge a server listing: reveal newly visible characters and refresh
    /// details of known ones.
    fn absorb(&mut self, records: Vec<CharacterRecord>) -> Vec<TrackerAction> {
        let (chapter, paragraph) = self.position;
        let mut changed = false;
        let mut revealed = Vec::new();
        let mut actions = Vec::new();

        for record in records {
            if self.is_discovered(&record.id) {
                if self.history.details.get(&record.id) != Some(&record) {
                    debug!(character = %record.id, "Updating known character details");
                    self.history.details.insert(record.id.clone(), record);
                    changed = true;
                }
                continue;
            }
            if !record.is_visible_at(chapter, paragraph) {
                continue;
            }
            info!(
                character = %record.id,
                name = %record.name,
                chapter,
                paragraph,
                "Discovered character"
            );
            self.history.discovered.push(record.id.clone());
            self.history.details.insert(record.id.clone(), record.clone());
            actions.extend(wrap_toasts(self.toasts.enqueue(record.clone())));
            revealed.push(record);
            changed = true;
        }

        if !revealed.is_empty() {
            actions.insert(0, TrackerAction::Discovered(revealed));
        }
        if changed {
            actions.push(TrackerAction::Persist);
        }
        actions
    }
}

fn wrap_toasts(actions: Vec<ToastAction>) -> Vec<TrackerAction> {
    actions.into_iter().map(TrackerAction::Toast).collect()
}
