//! Polling of server-side generation jobs (recaps, quizzes, illustrations).
//!
//! One job is tracked per kind for the current chapter. The poller never
//! talks to the network itself; it returns [`PollAction`]s describing the
//! fetches and timers the runtime should run, and is fed their results.
//!
//! Rules enforced here:
//! - at most one status request in flight per job, and none repeated within
//!   the dedupe window;
//! - at most one poll timer per job, cancelled before a new one is armed;
//! - polling stops when the job resolves, the view hides, the chapter changes,
//!   or the attempt ceiling is hit;
//! - `Ready` and `Failed` fire once per job instance.

use crate::error::ServiceError;
use crate::model::{FeatureFlags, JobKey, JobKind, JobSnapshot, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub dedupe_window: Duration,
    pub auto_request: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum JobFailure {
    /// The server reported FAILED.
    Generation,
    /// The attempt ceiling was reached while the job was still in progress.
    TimedOut,
    /// A request-generation or regenerate command was rejected.
    RequestRejected,
    RegenerationFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollAction {
    FetchStatus {
        request_id: u64,
        key: JobKey,
    },
    RequestGeneration {
        request_id: u64,
        key: JobKey,
    },
    Regenerate {
        request_id: u64,
        key: JobKey,
        parameter: String,
    },
    ScheduleTick {
        key: JobKey,
        delay: Duration,
    },
    CancelTick {
        key: JobKey,
    },
    StatusChanged {
        key: JobKey,
        status: JobStatus,
    },
    Ready {
        key: JobKey,
        payload: Option<Value>,
    },
    /// A regenerated artifact is waiting to be accepted.
    CandidateReady {
        key: JobKey,
        payload: Option<Value>,
    },
    Accepted {
        key: JobKey,
        payload: Option<Value>,
    },
    Failed {
        key: JobKey,
        reason: JobFailure,
    },
}

#[derive(Debug)]
struct JobEntry {
    key: JobKey,
    status: Option<JobStatus>,
    displayed: Option<Value>,
    candidate: Option<Value>,
    attempts: u32,
    in_flight: Option<u64>,
    command_in_flight: Option<u64>,
    timer_armed: bool,
    last_fetch_at: Option<Instant>,
    visible: bool,
    requested: bool,
    regenerating: bool,
    settled: bool,
}

impl JobEntry {
    fn new(key: JobKey) -> Self {
        Self {
            key,
            status: None,
            displayed: None,
            candidate: None,
            attempts: 0,
            in_flight: None,
            command_in_flight: None,
            timer_armed: false,
            last_fetch_at: None,
            visible: false,
            requested: false,
            regenerating: false,
            settled: false,
        }
    }
}

/// Read-only view of a tracked job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub key: JobKey,
    pub status: Option<JobStatus>,
    pub displayed: Option<Value>,
    pub candidate: Option<Value>,
    pub attempts: u32,
    pub polling: bool,
}

pub struct EnrichmentPoller {
    config: PollerConfig,
    features: FeatureFlags,
    jobs: HashMap<JobKind, JobEntry>,
    request_seq: u64,
}

impl EnrichmentPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            features: FeatureFlags::default(),
            jobs: HashMap::new(),
            request_seq: 0,
        }
    }

    pub fn set_features(&mut self, features: FeatureFlags) -> Vec<PollAction> {
        self.features = features;
        let disabled: Vec<JobKind> = self
            .jobs
            .keys()
            .copied()
            .filter(|kind| !features.allows(*kind))
            .collect();
        let mut actions = Vec::new();
        for kind in disabled {
            if let Some(entry) = self.jobs.remove(&kind) {
                cancel_tick(entry, &mut actions);
            }
        }
        actions
    }

    pub fn view(&self, kind: JobKind) -> Option<JobView> {
        self.jobs.get(&kind).map(|entry| JobView {
            key: entry.key.clone(),
            status: entry.status,
            displayed: entry.displayed.clone(),
            candidate: entry.candidate.clone(),
            attempts: entry.attempts,
            polling: entry.timer_armed || entry.in_flight.is_some(),
        })
    }

    /// Start tracking `key`, or refresh it if already tracked. `visible`
    /// marks that a view is showing the job; hidden jobs get a single status
    /// check and are not polled.
    pub fn open(&mut self, key: JobKey, visible: bool, now: Instant) -> Vec<PollAction> {
        if !self.features.allows(key.kind) {
            debug!(job = %key, "Job kind disabled for this book; not polling");
            return Vec::new();
        }
        let mut actions = Vec::new();
        let stale = self
            .jobs
            .get(&key.kind)
            .is_some_and(|entry| entry.key != key);
        if stale {
            if let Some(entry) = self.jobs.remove(&key.kind) {
                cancel_tick(entry, &mut actions);
            }
        }

        let interval = self.config.interval;
        let dedupe = self.config.dedupe_window;
        let max_attempts = self.config.max_attempts;
        let entry = self
            .jobs
            .entry(key.kind)
            .or_insert_with(|| JobEntry::new(key.clone()));
        entry.visible |= visible;

        let timed_out = entry.attempts >= max_attempts
            && entry.status.is_some_and(JobStatus::is_in_progress);
        if entry.settled && (timed_out || entry.status == Some(JobStatus::Failed)) {
            debug!(job = %entry.key, "Reopening settled job; resetting attempts");
            entry.settled = false;
            entry.attempts = 0;
            entry.requested = false;
            entry.last_fetch_at = None;
        }
        if entry.settled {
            return actions;
        }

        if entry.in_flight.is_some() {
            debug!(job = %entry.key, "Status request already in flight");
            return actions;
        }
        let recent = entry
            .last_fetch_at
            .is_some_and(|at| now.saturating_duration_since(at) < dedupe);
        if recent {
            debug!(job = %entry.key, "Status fetched recently; skipping duplicate request");
            if entry.visible
                && !entry.timer_armed
                && entry.status.is_some_and(JobStatus::is_in_progress)
            {
                entry.timer_armed = true;
                actions.push(PollAction::ScheduleTick {
                    key: entry.key.clone(),
                    delay: interval,
                });
            }
            return actions;
        }

        self.request_seq = self.request_seq.wrapping_add(1);
        issue_fetch(entry, self.request_seq, now, &mut actions);
        actions
    }

    pub fn set_visible(&mut self, kind: JobKind, visible: bool, now: Instant) -> Vec<PollAction> {
        if visible {
            let Some(key) = self.jobs.get(&kind).map(|entry| entry.key.clone()) else {
                return Vec::new();
            };
            return self.open(key, true, now);
        }
        let mut actions = Vec::new();
        if let Some(entry) = self.jobs.get_mut(&kind) {
            entry.visible = false;
            if entry.timer_armed {
                debug!(job = %entry.key, "View hidden; stopping poll");
                entry.timer_armed = false;
                actions.push(PollAction::CancelTick {
                    key: entry.key.clone(),
                });
            }
        }
        actions
    }

    /// Drop every job that does not belong to `chapter_id`.
    pub fn context_changed(&mut self, chapter_id: &str) -> Vec<PollAction> {
        let mut actions = Vec::new();
        let kinds: Vec<JobKind> = self
            .jobs
            .iter()
            .filter(|(_, entry)| entry.key.chapter_id != chapter_id)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in kinds {
            if let Some(entry) = self.jobs.remove(&kind) {
                debug!(job = %entry.key, "Job context changed; dropping");
                cancel_tick(entry, &mut actions);
            }
        }
        actions
    }

    pub fn clear(&mut self) -> Vec<PollAction> {
        let mut actions = Vec::new();
        for (_, entry) in self.jobs.drain() {
            cancel_tick(entry, &mut actions);
        }
        actions
    }

    pub fn on_tick(&mut self, key: &JobKey, now: Instant) -> Vec<PollAction> {
        let mut actions = Vec::new();
        let Some(entry) = self.jobs.get_mut(&key.kind).filter(|e| &e.key == key) else {
            debug!(job = %key, "Ignoring tick for untracked job");
            return actions;
        };
        if !entry.timer_armed {
            return actions;
        }
        entry.timer_armed = false;
        if !entry.visible || entry.settled || entry.in_flight.is_some() {
            return actions;
        }
        self.request_seq = self.request_seq.wrapping_add(1);
        issue_fetch(entry, self.request_seq, now, &mut actions);
        actions
    }

    pub fn on_status(
        &mut self,
        request_id: u64,
        result: Result<JobSnapshot, ServiceError>,
    ) -> Vec<PollAction> {
        let mut actions = Vec::new();
        let Some(entry) = self
            .jobs
            .values_mut()
            .find(|entry| entry.in_flight == Some(request_id))
        else {
            debug!(request_id, "Ignoring stale job status");
            return actions;
        };
        entry.in_flight = None;
        match result {
            Ok(snapshot) => {
                self.request_seq = self.request_seq.wrapping_add(1);
                apply_snapshot(entry, snapshot, &self.config, self.request_seq, &mut actions);
            }
            Err(err) => {
                warn!(job = %entry.key, attempts = entry.attempts, "Job status fetch failed: {err}");
                if entry.visible && !entry.settled {
                    schedule_tick(entry, &self.config, &mut actions);
                }
            }
        }
        actions
    }

    /// Explicit user request to generate a MISSING (or FAILED) job.
    pub fn request_generation(&mut self, kind: JobKind) -> Vec<PollAction> {
        let mut actions = Vec::new();
        let Some(entry) = self.jobs.get_mut(&kind) else {
            return actions;
        };
        if entry.command_in_flight.is_some()
            || (entry.requested && entry.status != Some(JobStatus::Failed))
        {
            debug!(job = %entry.key, "Generation already requested");
            return actions;
        }
        self.request_seq = self.request_seq.wrapping_add(1);
        issue_request(entry, self.request_seq, &mut actions);
        actions
    }

    /// Ask the server for a new version of the artifact. The accepted one
    /// stays displayed until [`accept_candidate`](Self::accept_candidate).
    pub fn regenerate(&mut self, kind: JobKind, parameter: String) -> Vec<PollAction> {
        let mut actions = Vec::new();
        let Some(entry) = self.jobs.get_mut(&kind) else {
            return actions;
        };
        if entry.command_in_flight.is_some() || entry.regenerating {
            debug!(job = %entry.key, "Regeneration already running");
            return actions;
        }
        self.request_seq = self.request_seq.wrapping_add(1);
        let request_id = self.request_seq;
        entry.regenerating = true;
        entry.candidate = None;
        entry.settled = false;
        entry.attempts = 0;
        entry.command_in_flight = Some(request_id);
        info!(job = %entry.key, "Requesting regeneration");
        actions.push(PollAction::Regenerate {
            request_id,
            key: entry.key.clone(),
            parameter,
        });
        actions
    }

    /// Result of a request-generation or regenerate command.
    pub fn on_command_result(
        &mut self,
        request_id: u64,
        result: Result<JobSnapshot, ServiceError>,
    ) -> Vec<PollAction> {
        let mut actions = Vec::new();
        let Some(entry) = self
            .jobs
            .values_mut()
            .find(|entry| entry.command_in_flight == Some(request_id))
        else {
            debug!(request_id, "Ignoring stale generation command result");
            return actions;
        };
        entry.command_in_flight = None;
        match result {
            Ok(snapshot) => {
                self.request_seq = self.request_seq.wrapping_add(1);
                apply_snapshot(entry, snapshot, &self.config, self.request_seq, &mut actions);
            }
            Err(err) => {
                warn!(job = %entry.key, "Generation command failed: {err}");
                let reason = if entry.regenerating {
                    JobFailure::RegenerationFailed
                } else {
                    JobFailure::RequestRejected
                };
                entry.regenerating = false;
                entry.requested = false;
                actions.push(PollAction::Failed {
                    key: entry.key.clone(),
                    reason,
                });
            }
        }
        actions
    }

    pub fn accept_candidate(&mut self, kind: JobKind) -> Vec<PollAction> {
        let Some(entry) = self.jobs.get_mut(&kind) else {
            return Vec::new();
        };
        let Some(candidate) = entry.candidate.take() else {
            return Vec::new();
        };
        entry.displayed = Some(candidate);
        info!(job = %entry.key, "Accepted regenerated artifact");
        vec![PollAction::Accepted {
            key: entry.key.clone(),
            payload: entry.displayed.clone(),
        }]
    }

    pub fn discard_candidate(&mut self, kind: JobKind) {
        if let Some(entry) = self.jobs.get_mut(&kind) {
            entry.candidate = None;
        }
    }
}

/// Every status fetch, the first one included, counts toward the ceiling.
fn issue_fetch(entry: &mut JobEntry, request_id: u64, now: Instant, actions: &mut Vec<PollAction>) {
    entry.attempts += 1;
    entry.in_flight = Some(request_id);
    entry.last_fetch_at = Some(now);
    debug!(job = %entry.key, request_id, attempts = entry.attempts, "Fetching job status");
    actions.push(PollAction::FetchStatus {
        request_id,
        key: entry.key.clone(),
    });
}

fn issue_request(entry: &mut JobEntry, request_id: u64, actions: &mut Vec<PollAction>) {
    entry.requested = true;
    entry.settled = false;
    entry.command_in_flight = Some(request_id);
    info!(job = %entry.key, "Requesting generation");
    actions.push(PollAction::RequestGeneration {
        request_id,
        key: entry.key.clone(),
    });
}

fn apply_snapshot(
    entry: &mut JobEntry,
    snapshot: JobSnapshot,
    config: &PollerConfig,
    next_request_id: u64,
    actions: &mut Vec<PollAction>,
) {
    if entry.status != Some(snapshot.status) {
        entry.status = Some(snapshot.status);
        actions.push(PollAction::StatusChanged {
            key: entry.key.clone(),
            status: snapshot.status,
        });
    }

    match snapshot.status {
        JobStatus::Completed => {
            stop_timer(entry, actions);
            if entry.regenerating {
                entry.regenerating = false;
                entry.candidate = snapshot.payload.clone();
                entry.settled = true;
                actions.push(PollAction::CandidateReady {
                    key: entry.key.clone(),
                    payload: snapshot.payload,
                });
            } else if !entry.settled {
                entry.settled = true;
                entry.displayed = snapshot.payload.clone();
                info!(job = %entry.key, attempts = entry.attempts, "Job completed");
                actions.push(PollAction::Ready {
                    key: entry.key.clone(),
                    payload: snapshot.payload,
                });
            }
        }
        JobStatus::Failed => {
            stop_timer(entry, actions);
            if !entry.settled {
                entry.settled = true;
                let reason = if entry.regenerating {
                    JobFailure::RegenerationFailed
                } else {
                    JobFailure::Generation
                };
                entry.regenerating = false;
                warn!(job = %entry.key, ?reason, "Job failed");
                actions.push(PollAction::Failed {
                    key: entry.key.clone(),
                    reason,
                });
            }
        }
        JobStatus::Missing => {
            stop_timer(entry, actions);
            if config.auto_request
                && entry.visible
                && !entry.requested
                && entry.command_in_flight.is_none()
            {
                issue_request(entry, next_request_id, actions);
            }
        }
        JobStatus::Pending | JobStatus::Generating => {
            if entry.visible && !entry.settled {
                schedule_tick(entry, config, actions);
            }
        }
    }
}

fn schedule_tick(entry: &mut JobEntry, config: &PollerConfig, actions: &mut Vec<PollAction>) {
    if entry.attempts >= config.max_attempts {
        stop_timer(entry, actions);
        entry.settled = true;
        let reason = if entry.regenerating {
            JobFailure::RegenerationFailed
        } else {
            JobFailure::TimedOut
        };
        entry.regenerating = false;
        warn!(job = %entry.key, attempts = entry.attempts, "Job polling timed out");
        actions.push(PollAction::Failed {
            key: entry.key.clone(),
            reason,
        });
        return;
    }
    stop_timer(entry, actions);
    entry.timer_armed = true;
    actions.push(PollAction::ScheduleTick {
        key: entry.key.clone(),
        delay: config.interval,
    });
}

fn stop_timer(entry: &mut JobEntry, actions: &mut Vec<PollAction>) {
    if entry.timer_armed {
        entry.timer_armed = false;
        actions.push(PollAction::CancelTick {
            key: entry.key.clone(),
        });
    }
}

fn cancel_tick(entry: JobEntry, actions: &mut Vec<PollAction>) {
    if entry.timer_armed {
        actions.push(PollAction::CancelTick { key: entry.key });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(2),
            max_attempts: 3,
            dedupe_window: Duration::from_millis(1500),
            auto_request: true,
        }
    }

    fn poller() -> EnrichmentPoller {
        let mut poller = EnrichmentPoller::new(config());
        poller.set_features(FeatureFlags {
            narration: true,
            illustration: true,
            character: true,
            recap: true,
            quiz: true,
        });
        poller
    }

    fn key(kind: JobKind) -> JobKey {
        JobKey::new(kind, "ch3")
    }

    fn fetch_id(actions: &[PollAction]) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            PollAction::FetchStatus { request_id, .. } => Some(*request_id),
            _ => None,
        })
    }

    fn command_id(actions: &[PollAction]) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            PollAction::RequestGeneration { request_id, .. }
            | PollAction::Regenerate { request_id, .. } => Some(*request_id),
            _ => None,
        })
    }

    fn count(actions: &[PollAction], pred: impl Fn(&PollAction) -> bool) -> usize {
        actions.iter().filter(|a| pred(a)).count()
    }

    #[test]
    fn pending_pending_completed_fires_one_ready_and_stops() {
        let mut p = poller();
        let t0 = Instant::now();
        let mut all = Vec::new();

        let id = fetch_id(&p.open(key(JobKind::Recap), true, t0)).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Pending)));
        assert_eq!(count(&actions, |a| matches!(a, PollAction::ScheduleTick { .. })), 1);
        all.extend(actions);

        let id = fetch_id(&p.on_tick(&key(JobKind::Recap), t0 + Duration::from_secs(2))).unwrap();
        all.extend(p.on_status(id, Ok(JobSnapshot::new(JobStatus::Pending))));

        let id = fetch_id(&p.on_tick(&key(JobKind::Recap), t0 + Duration::from_secs(4))).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::completed(json!({"text": "recap"}))));
        assert_eq!(count(&actions, |a| matches!(a, PollAction::ScheduleTick { .. })), 0);
        all.extend(actions);

        assert_eq!(count(&all, |a| matches!(a, PollAction::Ready { .. })), 1);
        assert!(p.on_tick(&key(JobKind::Recap), t0 + Duration::from_secs(6)).is_empty());
        assert!(p.open(key(JobKind::Recap), true, t0 + Duration::from_secs(8)).is_empty());
        let view = p.view(JobKind::Recap).unwrap();
        assert_eq!(view.displayed, Some(json!({"text": "recap"})));
        assert!(!view.polling);
    }

    #[test]
    fn stuck_job_times_out_exactly_once() {
        let mut p = poller();
        let t0 = Instant::now();
        let mut fetches = 0;
        let mut failures = Vec::new();

        let mut actions = p.open(key(JobKind::Quiz), true, t0);
        for step in 1..20u64 {
            if let Some(id) = fetch_id(&actions) {
                fetches += 1;
                let result = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Pending)));
                failures.extend(result.into_iter().filter_map(|a| match a {
                    PollAction::Failed { reason, .. } => Some(reason),
                    _ => None,
                }));
            }
            actions = p.on_tick(&key(JobKind::Quiz), t0 + Duration::from_secs(2 * step));
        }
        assert_eq!(failures, vec![JobFailure::TimedOut]);
        assert_eq!(fetches, 3, "the opening fetch counts as an attempt");
    }

    #[test]
    fn duplicate_opens_are_deduplicated() {
        let mut p = poller();
        let t0 = Instant::now();
        let first = p.open(key(JobKind::Recap), false, t0);
        let id = fetch_id(&first).unwrap();
        assert!(fetch_id(&p.open(key(JobKind::Recap), true, t0)).is_none(), "in flight");

        let actions = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Generating)));
        assert_eq!(count(&actions, |a| matches!(a, PollAction::ScheduleTick { .. })), 1);

        let again = p.open(key(JobKind::Recap), true, t0 + Duration::from_millis(500));
        assert!(fetch_id(&again).is_none(), "within dedupe window");
        let later = p.open(key(JobKind::Recap), true, t0 + Duration::from_secs(3));
        assert!(fetch_id(&later).is_some());
    }

    #[test]
    fn hidden_view_stops_polling() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Recap), true, t0)).unwrap();
        p.on_status(id, Ok(JobSnapshot::new(JobStatus::Pending)));
        let actions = p.set_visible(JobKind::Recap, false, t0);
        assert_eq!(actions, vec![PollAction::CancelTick { key: key(JobKind::Recap) }]);
        assert!(p.on_tick(&key(JobKind::Recap), t0 + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn hidden_job_is_checked_once_but_not_polled() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Illustration), false, t0)).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Pending)));
        assert_eq!(actions.len(), 1, "only the status change");
    }

    #[test]
    fn chapter_change_drops_job_and_late_status() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Recap), true, t0)).unwrap();
        p.context_changed("ch4");
        assert!(p.view(JobKind::Recap).is_none());
        assert!(p.on_status(id, Ok(JobSnapshot::new(JobStatus::Completed))).is_empty());
    }

    #[test]
    fn missing_job_is_auto_requested_once() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Recap), true, t0)).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Missing)));
        let command = command_id(&actions).unwrap();
        assert!(p.request_generation(JobKind::Recap).is_empty(), "idempotent");

        let actions = p.on_command_result(command, Ok(JobSnapshot::new(JobStatus::Pending)));
        assert_eq!(count(&actions, |a| matches!(a, PollAction::ScheduleTick { .. })), 1);

        let id = fetch_id(&p.on_tick(&key(JobKind::Recap), t0 + Duration::from_secs(2))).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Missing)));
        assert!(command_id(&actions).is_none());
    }

    #[test]
    fn transient_errors_keep_polling() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Recap), true, t0)).unwrap();
        let actions = p.on_status(id, Err(ServiceError::Transport("timeout".into())));
        assert_eq!(count(&actions, |a| matches!(a, PollAction::ScheduleTick { .. })), 1);
        assert_eq!(count(&actions, |a| matches!(a, PollAction::Failed { .. })), 0);
    }

    #[test]
    fn regeneration_keeps_displayed_image_until_accepted() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Illustration), true, t0)).unwrap();
        p.on_status(id, Ok(JobSnapshot::completed(json!("old.png"))));

        let command = command_id(&p.regenerate(JobKind::Illustration, "watercolor".into())).unwrap();
        p.on_command_result(command, Ok(JobSnapshot::new(JobStatus::Pending)));
        let id = fetch_id(&p.on_tick(&key(JobKind::Illustration), t0 + Duration::from_secs(2))).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::completed(json!("new.png"))));
        assert!(actions.iter().any(|a| matches!(a, PollAction::CandidateReady { .. })));
        assert_eq!(p.view(JobKind::Illustration).unwrap().displayed, Some(json!("old.png")));

        let actions = p.accept_candidate(JobKind::Illustration);
        assert_eq!(
            actions,
            vec![PollAction::Accepted {
                key: key(JobKind::Illustration),
                payload: Some(json!("new.png"))
            }]
        );
        assert_eq!(p.view(JobKind::Illustration).unwrap().displayed, Some(json!("new.png")));
    }

    #[test]
    fn failed_regeneration_leaves_displayed_image() {
        let mut p = poller();
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Illustration), true, t0)).unwrap();
        p.on_status(id, Ok(JobSnapshot::completed(json!("old.png"))));

        let command = command_id(&p.regenerate(JobKind::Illustration, "ink".into())).unwrap();
        let actions = p.on_command_result(command, Ok(JobSnapshot::new(JobStatus::Failed)));
        assert!(actions.contains(&PollAction::Failed {
            key: key(JobKind::Illustration),
            reason: JobFailure::RegenerationFailed
        }));
        let view = p.view(JobKind::Illustration).unwrap();
        assert_eq!(view.displayed, Some(json!("old.png")));
        assert!(view.candidate.is_none());
        assert!(p.accept_candidate(JobKind::Illustration).is_empty());
    }

    #[test]
    fn disabled_kinds_are_never_polled() {
        let mut p = EnrichmentPoller::new(config());
        p.set_features(FeatureFlags {
            recap: true,
            ..FeatureFlags::default()
        });
        assert!(p.open(key(JobKind::Quiz), true, Instant::now()).is_empty());
        assert!(fetch_id(&p.open(key(JobKind::Recap), true, Instant::now())).is_some());
    }

    #[test]
    fn reopening_after_timeout_resets_attempts() {
        let mut p = EnrichmentPoller::new(PollerConfig {
            max_attempts: 0,
            ..config()
        });
        p.set_features(FeatureFlags {
            quiz: true,
            ..FeatureFlags::default()
        });
        let t0 = Instant::now();
        let id = fetch_id(&p.open(key(JobKind::Quiz), true, t0)).unwrap();
        let actions = p.on_status(id, Ok(JobSnapshot::new(JobStatus::Pending)));
        assert!(actions.contains(&PollAction::Failed {
            key: key(JobKind::Quiz),
            reason: JobFailure::TimedOut
        }));
        let reopened = p.open(key(JobKind::Quiz), true, t0 + Duration::from_secs(10));
        assert!(fetch_id(&reopened).is_some());
    }
}
