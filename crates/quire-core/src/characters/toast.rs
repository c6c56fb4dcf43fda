use crate::model::CharacterRecord;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq)]
pub enum ToastAction {
    ScheduleDismiss { generation: u64, delay: Duration },
    CancelDismiss,
    Changed(ToastSnapshot),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ToastSnapshot {
    pub current: Option<CharacterRecord>,
    pub queued: usize,
}

/// FIFO of discovery toasts. Exactly one is shown at a time; each one owns a
/// dismiss timer identified by its generation.
#[derive(Debug)]
pub struct ToastQueue {
    current: Option<CharacterRecord>,
    pending: VecDeque<CharacterRecord>,
    generation: u64,
    duration: Duration,
}

impl ToastQueue {
    pub fn new(duration: Duration) -> Self {
        Self {
            current: None,
            pending: VecDeque::new(),
            generation: 0,
            duration,
        }
    }

    pub fn snapshot(&self) -> ToastSnapshot {
        ToastSnapshot {
            current: self.current.clone(),
            queued: self.pending.len(),
        }
    }

    pub fn current(&self) -> Option<&CharacterRecord> {
        self.current.as_ref()
    }

    pub fn enqueue(&mut self, record: CharacterRecord) -> Vec<ToastAction> {
        self.pending.push_back(record);
        if self.current.is_some() {
            return vec![ToastAction::Changed(self.snapshot())];
        }
        self.advance()
    }

    /// Manual dismissal of the toast on screen.
    pub fn dismiss(&mut self) -> Vec<ToastAction> {
        if self.current.is_none() {
            return Vec::new();
        }
        let mut actions = vec![ToastAction::CancelDismiss];
        actions.extend(self.advance());
        actions
    }

    pub fn on_dismiss_timer(&mut self, generation: u64) -> Vec<ToastAction> {
        if generation != self.generation || self.current.is_none() {
            debug!(generation, current = self.generation, "Ignoring stale toast timer");
            return Vec::new();
        }
        self.advance()
    }

    pub fn clear(&mut self) -> Vec<ToastAction> {
        if self.current.is_none() && self.pending.is_empty() {
            return Vec::new();
        }
        self.current = None;
        self.pending.clear();
        self.generation = self.generation.wrapping_add(1);
        vec![
            ToastAction::CancelDismiss,
            ToastAction::Changed(self.snapshot()),
        ]
    }

    fn advance(&mut self) -> Vec<ToastAction> {
        self.current = self.pending.pop_front();
        self.generation = self.generation.wrapping_add(1);
        let mut actions = Vec::new();
        if let Some(record) = &self.current {
            debug!(character = %record.id, queued = self.pending.len(), "Presenting toast");
            actions.push(ToastAction::ScheduleDismiss {
                generation: self.generation,
                delay: self.duration,
            });
        }
        actions.push(ToastAction::Changed(self.snapshot()));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> CharacterRecord {
        CharacterRecord {
            id: id.into(),
            name: id.to_uppercase(),
            description: String::new(),
            first_chapter_index: 0,
            first_paragraph_index: 0,
            portrait_ready: false,
        }
    }

    fn dismiss_generation(actions: &[ToastAction]) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            ToastAction::ScheduleDismiss { generation, .. } => Some(*generation),
            _ => None,
        })
    }

    #[test]
    fn shows_one_toast_at_a_time_in_order() {
        let mut queue = ToastQueue::new(Duration::from_secs(8));
        let first = queue.enqueue(record("a"));
        let generation = dismiss_generation(&first).unwrap();
        let second = queue.enqueue(record("b"));
        assert!(dismiss_generation(&second).is_none());
        queue.enqueue(record("c"));
        assert_eq!(queue.snapshot().queued, 2);
        assert_eq!(queue.current().map(|r| r.id.as_str()), Some("a"));

        let actions = queue.on_dismiss_timer(generation);
        assert_eq!(queue.current().map(|r| r.id.as_str()), Some("b"));
        let generation = dismiss_generation(&actions).unwrap();

        let actions = queue.dismiss();
        assert_eq!(actions[0], ToastAction::CancelDismiss);
        assert_eq!(queue.current().map(|r| r.id.as_str()), Some("c"));
        assert!(queue.on_dismiss_timer(generation).is_empty(), "old timer is stale");
    }

    #[test]
    fn queue_drains_to_empty() {
        let mut queue = ToastQueue::new(Duration::from_secs(8));
        let generation = dismiss_generation(&queue.enqueue(record("a"))).unwrap();
        let actions = queue.on_dismiss_timer(generation);
        assert_eq!(actions, vec![ToastAction::Changed(ToastSnapshot::default())]);
        assert!(queue.dismiss().is_empty());
    }
}
