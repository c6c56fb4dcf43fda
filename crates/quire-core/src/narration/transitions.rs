use super::{
    ActiveSlot, AudioClip, ClipKey, NarrationMode, NarrationPipeline, NarrationState,
    NarrationTarget, PrefetchSlot,
};
use crate::cancellation::CancellationToken;
use crate::error::ServiceError;
use crate::model::VoiceParams;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum NarrationEvent {
    Start(Option<NarrationTarget>),
    Stop,
    Pause,
    Resume,
    /// The cursor moved while narrating. `None` while the next chapter loads.
    Retarget(Option<NarrationTarget>),
    SetPrimaryAvailable(bool),
    VoiceChanged(VoiceParams),
    FetchResolved {
        request_id: u64,
        result: Result<AudioClip, ServiceError>,
    },
    PlaybackEnded {
        clip_id: u64,
    },
    PlaybackFailed {
        clip_id: u64,
        reason: String,
    },
    FallbackEnded {
        utterance_id: u64,
    },
    FallbackFailed {
        utterance_id: u64,
        reason: String,
    },
    GraceElapsed {
        seq: u64,
    },
}

#[derive(Debug)]
pub enum NarrationAction {
    Fetch {
        request_id: u64,
        key: ClipKey,
        voice: VoiceParams,
        token: CancellationToken,
        prefetch: bool,
    },
    Play {
        clip_id: u64,
        key: ClipKey,
        data: Arc<[u8]>,
    },
    PausePlayback {
        clip_id: u64,
    },
    ResumePlayback {
        clip_id: u64,
    },
    StopPlayback {
        clip_id: u64,
    },
    Release(AudioClip),
    SpeakFallback {
        utterance_id: u64,
        key: ClipKey,
        text: String,
    },
    CancelFallback {
        utterance_id: u64,
    },
    ScheduleGrace {
        seq: u64,
        delay: Duration,
    },
    /// The paragraph finished (or was skipped); move the cursor forward.
    Advance {
        from: ClipKey,
    },
    ModeChanged {
        mode: NarrationMode,
        key: Option<ClipKey>,
    },
    StateChanged(NarrationState),
}

pub fn transition(p: &mut NarrationPipeline, event: NarrationEvent) -> Vec<NarrationAction> {
    match event {
        NarrationEvent::Start(target) => on_start(p, target),
        NarrationEvent::Stop => on_stop(p),
        NarrationEvent::Pause => on_pause(p),
        NarrationEvent::Resume => on_resume(p),
        NarrationEvent::Retarget(target) => on_retarget(p, target),
        NarrationEvent::SetPrimaryAvailable(available) => {
            p.primary_available = available;
            Vec::new()
        }
        NarrationEvent::VoiceChanged(voice) => on_voice_changed(p, voice),
        NarrationEvent::FetchResolved { request_id, result } => {
            on_fetch_resolved(p, request_id, result)
        }
        NarrationEvent::PlaybackEnded { clip_id } => on_playback_ended(p, clip_id),
        NarrationEvent::PlaybackFailed { clip_id, reason } => {
            on_playback_failed(p, clip_id, &reason)
        }
        NarrationEvent::FallbackEnded { utterance_id } => on_fallback_ended(p, utterance_id),
        NarrationEvent::FallbackFailed {
            utterance_id,
            reason,
        } => on_fallback_failed(p, utterance_id, &reason),
        NarrationEvent::GraceElapsed { seq } => on_grace_elapsed(p, seq),
    }
}

fn on_start(p: &mut NarrationPipeline, target: Option<NarrationTarget>) -> Vec<NarrationAction> {
    match p.state {
        NarrationState::Speaking => return on_retarget(p, target),
        NarrationState::Paused => {
            let mut actions = on_retarget(p, target);
            actions.extend(on_resume(p));
            return actions;
        }
        NarrationState::Stopped => {}
    }
    if !p.can_narrate() {
        warn!("Narration requested but neither primary audio nor fallback speech is available");
        return Vec::new();
    }

    p.state = NarrationState::Speaking;
    info!(
        key = ?target.as_ref().map(|t| t.key.to_string()),
        "Starting narration"
    );
    let mut actions = vec![NarrationAction::StateChanged(NarrationState::Speaking)];
    actions.extend(begin(p, target));
    actions
}

fn on_stop(p: &mut NarrationPipeline) -> Vec<NarrationAction> {
    if p.state == NarrationState::Stopped {
        return Vec::new();
    }
    let mut actions = vacate_active(p);
    discard_prefetch(p, &mut actions);
    p.target = None;
    set_mode(p, NarrationMode::Primary, None, &mut actions);
    p.state = NarrationState::Stopped;
    info!("Narration stopped");
    actions.push(NarrationAction::StateChanged(NarrationState::Stopped));
    actions
}

fn on_pause(p: &mut NarrationPipeline) -> Vec<NarrationAction> {
    if p.state != NarrationState::Speaking {
        return Vec::new();
    }
    p.state = NarrationState::Paused;
    let mut actions = Vec::new();
    match &mut p.active {
        ActiveSlot::Clip {
            clip,
            started: true,
        } => actions.push(NarrationAction::PausePlayback { clip_id: clip.id() }),
        ActiveSlot::Fallback {
            utterance_id,
            started,
            ..
        } if *started => {
            actions.push(NarrationAction::CancelFallback {
                utterance_id: *utterance_id,
            });
            *started = false;
        }
        ActiveSlot::Grace { armed, .. } => *armed = false,
        _ => {}
    }
    debug!("Narration paused");
    actions.push(NarrationAction::StateChanged(NarrationState::Paused));
    actions
}

fn on_resume(p: &mut NarrationPipeline) -> Vec<NarrationAction> {
    if p.state != NarrationState::Paused {
        return Vec::new();
    }
    p.state = NarrationState::Speaking;
    let mut actions = vec![NarrationAction::StateChanged(NarrationState::Speaking)];
    let mut needs_prefetch = false;
    let fallback_text = p.target.as_ref().map(|t| t.text.clone()).unwrap_or_default();
    match &mut p.active {
        ActiveSlot::Clip { clip, started } => {
            if *started {
                actions.push(NarrationAction::ResumePlayback { clip_id: clip.id() });
            } else {
                *started = true;
                needs_prefetch = true;
                actions.push(play_action(clip));
            }
        }
        ActiveSlot::Fallback {
            key,
            utterance_id,
            started: started @ false,
        } => {
            // A fresh id so a late end from the cancelled utterance is ignored.
            p.utterance_id = p.utterance_id.wrapping_add(1);
            *utterance_id = p.utterance_id;
            *started = true;
            actions.push(NarrationAction::SpeakFallback {
                utterance_id: *utterance_id,
                key: key.clone(),
                text: fallback_text,
            });
        }
        ActiveSlot::Grace {
            seq,
            armed: armed @ false,
            ..
        } => {
            p.grace_seq = p.grace_seq.wrapping_add(1);
            *seq = p.grace_seq;
            *armed = true;
            actions.push(NarrationAction::ScheduleGrace {
                seq: *seq,
                delay: p.config.grace,
            });
        }
        _ => {}
    }
    if needs_prefetch {
        maybe_prefetch(p, &mut actions);
    }
    debug!("Narration resumed");
    actions
}

fn on_retarget(p: &mut NarrationPipeline, target: Option<NarrationTarget>) -> Vec<NarrationAction> {
    if p.state == NarrationState::Stopped {
        return Vec::new();
    }
    let unchanged = matches!(
        (target.as_ref(), p.active_key()),
        (Some(t), Some(active)) if &t.key == active
    );
    if unchanged {
        debug!("Narration already on this paragraph");
        p.target = target;
        return Vec::new();
    }
    begin(p, target)
}

fn on_voice_changed(p: &mut NarrationPipeline, voice: VoiceParams) -> Vec<NarrationAction> {
    if p.voice == voice {
        return Vec::new();
    }
    debug!(voice = %voice.voice, speed = voice.speed, "Narration voice changed; dropping prefetch");
    p.voice = voice;
    let mut actions = Vec::new();
    discard_prefetch(p, &mut actions);
    actions
}

fn on_fetch_resolved(
    p: &mut NarrationPipeline,
    request_id: u64,
    result: Result<AudioClip, ServiceError>,
) -> Vec<NarrationAction> {
    let mut actions = Vec::new();

    let active_key = match &p.active {
        ActiveSlot::Fetching {
            request_id: id,
            key,
            ..
        } if *id == request_id => Some(key.clone()),
        _ => None,
    };
    if let Some(key) = active_key {
        p.active = ActiveSlot::Idle;
        match result {
            Ok(clip) => start_clip(p, clip, &mut actions),
            Err(err) => {
                warn!(key = %key, request_id, "Narration audio fetch failed: {err}");
                enter_fallback_or_grace(p, key, &mut actions);
            }
        }
        return actions;
    }

    let is_prefetch = matches!(
        &p.prefetch,
        PrefetchSlot::Pending { request_id: id, .. } if *id == request_id
    );
    if is_prefetch {
        match result {
            Ok(clip) => {
                debug!(key = %clip.key(), request_id, "Prefetched narration audio ready");
                p.prefetch = PrefetchSlot::Ready(clip);
            }
            Err(err) => {
                debug!(request_id, "Narration prefetch failed: {err}");
                p.prefetch = PrefetchSlot::Empty;
            }
        }
        return actions;
    }

    debug!(
        request_id,
        current = p.request_id,
        "Ignoring stale narration audio"
    );
    if let Ok(clip) = result {
        actions.push(NarrationAction::Release(clip));
    }
    actions
}

fn on_playback_ended(p: &mut NarrationPipeline, clip_id: u64) -> Vec<NarrationAction> {
    let Some(clip) = take_clip(p, clip_id) else {
        debug!(clip_id, "Ignoring playback end for inactive clip");
        return Vec::new();
    };
    let from = clip.key().clone();
    vec![
        NarrationAction::Release(clip),
        NarrationAction::Advance { from },
    ]
}

fn on_playback_failed(p: &mut NarrationPipeline, clip_id: u64, reason: &str) -> Vec<NarrationAction> {
    let Some(clip) = take_clip(p, clip_id) else {
        debug!(clip_id, "Ignoring playback failure for inactive clip");
        return Vec::new();
    };
    let key = clip.key().clone();
    warn!(key = %key, clip_id, reason, "Narration playback failed");
    let mut actions = vec![NarrationAction::Release(clip)];
    enter_fallback_or_grace(p, key, &mut actions);
    actions
}

fn on_fallback_ended(p: &mut NarrationPipeline, utterance_id: u64) -> Vec<NarrationAction> {
    match &p.active {
        ActiveSlot::Fallback {
            utterance_id: id,
            key,
            started: true,
        } if *id == utterance_id => {
            let from = key.clone();
            p.active = ActiveSlot::Idle;
            vec![NarrationAction::Advance { from }]
        }
        _ => {
            debug!(utterance_id, "Ignoring stale fallback speech end");
            Vec::new()
        }
    }
}

fn on_fallback_failed(p: &mut NarrationPipeline, utterance_id: u64, reason: &str) -> Vec<NarrationAction> {
    let key = match &p.active {
        ActiveSlot::Fallback {
            utterance_id: id,
            key,
            ..
        } if *id == utterance_id => key.clone(),
        _ => {
            debug!(utterance_id, "Ignoring stale fallback speech failure");
            return Vec::new();
        }
    };
    warn!(key = %key, reason, "Fallback speech failed; skipping paragraph");
    let mut actions = Vec::new();
    schedule_grace(p, key, &mut actions);
    actions
}

fn on_grace_elapsed(p: &mut NarrationPipeline, seq: u64) -> Vec<NarrationAction> {
    match &p.active {
        ActiveSlot::Grace {
            seq: current,
            armed: true,
            key,
        } if *current == seq => {
            let from = key.clone();
            p.active = ActiveSlot::Idle;
            debug!(key = %from, "Grace delay elapsed; skipping paragraph");
            vec![NarrationAction::Advance { from }]
        }
        _ => Vec::new(),
    }
}

/// Point the active slot at `target`, superseding whatever it held.
fn begin(p: &mut NarrationPipeline, target: Option<NarrationTarget>) -> Vec<NarrationAction> {
    let mut actions = vacate_active(p);
    p.target = target.clone();
    let Some(target) = target else {
        return actions;
    };

    if target.text.trim().is_empty() {
        debug!(key = %target.key, "Skipping paragraph with no speakable text");
        actions.push(NarrationAction::Advance { from: target.key });
        return actions;
    }

    if !p.primary_available {
        set_mode(p, NarrationMode::Fallback, Some(&target.key), &mut actions);
        discard_prefetch(p, &mut actions);
        speak_fallback(p, target.key, &mut actions);
        return actions;
    }

    // Fallback applies to one paragraph only.
    set_mode(p, NarrationMode::Primary, Some(&target.key), &mut actions);

    match std::mem::replace(&mut p.prefetch, PrefetchSlot::Empty) {
        PrefetchSlot::Ready(clip) if clip.key() == &target.key => {
            debug!(key = %target.key, "Reusing prefetched narration audio");
            start_clip(p, clip, &mut actions);
        }
        PrefetchSlot::Pending {
            request_id,
            key,
            token,
        } if key == target.key => {
            debug!(key = %key, request_id, "Promoting pending prefetch to active fetch");
            p.active = ActiveSlot::Fetching {
                request_id,
                key,
                token,
            };
        }
        other => {
            p.prefetch = other;
            discard_prefetch(p, &mut actions);
            issue_fetch(p, target.key, &mut actions);
        }
    }
    actions
}

fn vacate_active(p: &mut NarrationPipeline) -> Vec<NarrationAction> {
    let mut actions = Vec::new();
    match std::mem::replace(&mut p.active, ActiveSlot::Idle) {
        ActiveSlot::Idle | ActiveSlot::Grace { .. } => {}
        ActiveSlot::Fetching {
            request_id,
            key,
            token,
        } => {
            debug!(key = %key, request_id, "Cancelling superseded narration fetch");
            token.cancel();
        }
        ActiveSlot::Clip { clip, started } => {
            if started {
                actions.push(NarrationAction::StopPlayback { clip_id: clip.id() });
            }
            actions.push(NarrationAction::Release(clip));
        }
        ActiveSlot::Fallback {
            utterance_id,
            started,
            ..
        } => {
            if started {
                actions.push(NarrationAction::CancelFallback { utterance_id });
            }
        }
    }
    actions
}

fn discard_prefetch(p: &mut NarrationPipeline, actions: &mut Vec<NarrationAction>) {
    match std::mem::replace(&mut p.prefetch, PrefetchSlot::Empty) {
        PrefetchSlot::Empty => {}
        PrefetchSlot::Pending {
            request_id, token, ..
        } => {
            debug!(request_id, "Cancelling narration prefetch");
            token.cancel();
        }
        PrefetchSlot::Ready(clip) => actions.push(NarrationAction::Release(clip)),
    }
}

fn issue_fetch(p: &mut NarrationPipeline, key: ClipKey, actions: &mut Vec<NarrationAction>) {
    p.request_id = p.request_id.wrapping_add(1);
    let request_id = p.request_id;
    let token = CancellationToken::new();
    debug!(key = %key, request_id, "Requesting narration audio");
    p.active = ActiveSlot::Fetching {
        request_id,
        key: key.clone(),
        token: token.clone(),
    };
    actions.push(NarrationAction::Fetch {
        request_id,
        key,
        voice: p.voice.clone(),
        token,
        prefetch: false,
    });
}

fn start_clip(p: &mut NarrationPipeline, clip: AudioClip, actions: &mut Vec<NarrationAction>) {
    let started = p.state == NarrationState::Speaking;
    if started {
        actions.push(play_action(&clip));
    }
    p.active = ActiveSlot::Clip { clip, started };
    if started {
        maybe_prefetch(p, actions);
    }
}

fn play_action(clip: &AudioClip) -> NarrationAction {
    NarrationAction::Play {
        clip_id: clip.id(),
        key: clip.key().clone(),
        data: clip.data(),
    }
}

fn maybe_prefetch(p: &mut NarrationPipeline, actions: &mut Vec<NarrationAction>) {
    if !p.config.prefetch
        || p.mode != NarrationMode::Primary
        || p.state != NarrationState::Speaking
        || !matches!(p.prefetch, PrefetchSlot::Empty)
    {
        return;
    }
    let Some(next) = p.target.as_ref().and_then(|t| t.next.clone()) else {
        return;
    };
    p.request_id = p.request_id.wrapping_add(1);
    let request_id = p.request_id;
    let token = CancellationToken::new();
    debug!(key = %next, request_id, "Prefetching next paragraph audio");
    p.prefetch = PrefetchSlot::Pending {
        request_id,
        key: next.clone(),
        token: token.clone(),
    };
    actions.push(NarrationAction::Fetch {
        request_id,
        key: next,
        voice: p.voice.clone(),
        token,
        prefetch: true,
    });
}

fn enter_fallback_or_grace(p: &mut NarrationPipeline, key: ClipKey, actions: &mut Vec<NarrationAction>) {
    if p.config.fallback_available {
        set_mode(p, NarrationMode::Fallback, Some(&key), actions);
        speak_fallback(p, key, actions);
    } else {
        schedule_grace(p, key, actions);
    }
}

fn speak_fallback(p: &mut NarrationPipeline, key: ClipKey, actions: &mut Vec<NarrationAction>) {
    let text = p
        .target
        .as_ref()
        .filter(|t| t.key == key)
        .map(|t| t.text.clone());
    let Some(text) = text else {
        schedule_grace(p, key, actions);
        return;
    };
    p.utterance_id = p.utterance_id.wrapping_add(1);
    let utterance_id = p.utterance_id;
    let started = p.state == NarrationState::Speaking;
    if started {
        actions.push(NarrationAction::SpeakFallback {
            utterance_id,
            key: key.clone(),
            text,
        });
    }
    p.active = ActiveSlot::Fallback {
        key,
        utterance_id,
        started,
    };
}

fn schedule_grace(p: &mut NarrationPipeline, key: ClipKey, actions: &mut Vec<NarrationAction>) {
    p.grace_seq = p.grace_seq.wrapping_add(1);
    let seq = p.grace_seq;
    let armed = p.state == NarrationState::Speaking;
    if armed {
        actions.push(NarrationAction::ScheduleGrace {
            seq,
            delay: p.config.grace,
        });
    }
    p.active = ActiveSlot::Grace { key, seq, armed };
}

fn set_mode(
    p: &mut NarrationPipeline,
    mode: NarrationMode,
    key: Option<&ClipKey>,
    actions: &mut Vec<NarrationAction>,
) {
    if p.mode == mode {
        return;
    }
    p.mode = mode;
    info!(?mode, key = ?key.map(ToString::to_string), "Narration mode changed");
    actions.push(NarrationAction::ModeChanged {
        mode,
        key: key.cloned(),
    });
}

fn take_clip(p: &mut NarrationPipeline, clip_id: u64) -> Option<AudioClip> {
    let matches = matches!(&p.active, ActiveSlot::Clip { clip, .. } if clip.id() == clip_id);
    if !matches {
        return None;
    }
    match std::mem::replace(&mut p.active, ActiveSlot::Idle) {
        ActiveSlot::Clip { clip, .. } => Some(clip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::NarrationConfig;
    use super::*;

    fn pipeline(fallback: bool) -> NarrationPipeline {
        NarrationPipeline::new(
            NarrationConfig {
                prefetch: true,
                fallback_available: fallback,
                grace: Duration::from_millis(1500),
            },
            VoiceParams {
                voice: "narrator".into(),
                speed: 1.0,
            },
        )
    }

    fn target(paragraph: usize) -> NarrationTarget {
        NarrationTarget {
            key: ClipKey::new("ch1", paragraph),
            text: format!("Paragraph {paragraph}."),
            next: Some(ClipKey::new("ch1", paragraph + 1)),
        }
    }

    fn fetches(actions: &[NarrationAction]) -> Vec<(u64, ClipKey, CancellationToken, bool)> {
        actions
            .iter()
            .filter_map(|action| match action {
                NarrationAction::Fetch {
                    request_id,
                    key,
                    token,
                    prefetch,
                    ..
                } => Some((*request_id, key.clone(), token.clone(), *prefetch)),
                _ => None,
            })
            .collect()
    }

    fn released(actions: &[NarrationAction]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|action| match action {
                NarrationAction::Release(clip) => Some(clip.id()),
                _ => None,
            })
            .collect()
    }

    fn played(actions: &[NarrationAction]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|action| match action {
                NarrationAction::Play { clip_id, .. } => Some(*clip_id),
                _ => None,
            })
            .collect()
    }

    fn clip(id: u64, paragraph: usize) -> AudioClip {
        AudioClip::new(id, ClipKey::new("ch1", paragraph), vec![1, 2, 3])
    }

    #[test]
    fn start_fetches_then_plays_and_prefetches_next() {
        let mut p = pipeline(true);
        let actions = p.handle(NarrationEvent::Start(Some(target(0))));
        assert!(matches!(
            actions[0],
            NarrationAction::StateChanged(NarrationState::Speaking)
        ));
        let fetch = fetches(&actions);
        assert_eq!(fetch.len(), 1);
        assert!(!fetch[0].3);

        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Ok(clip(10, 0)),
        });
        assert_eq!(played(&actions), vec![10]);
        let prefetch = fetches(&actions);
        assert_eq!(prefetch.len(), 1);
        assert_eq!(prefetch[0].1, ClipKey::new("ch1", 1));
        assert!(prefetch[0].3);
        assert_eq!(p.prefetched_key(), Some(&ClipKey::new("ch1", 1)));
    }

    #[test]
    fn navigation_cancels_previous_fetch_and_releases_its_late_clip() {
        let mut p = pipeline(true);
        let first = fetches(&p.handle(NarrationEvent::Start(Some(target(2)))));
        let (n_id, _, n_token, _) = first[0].clone();

        let second = fetches(&p.handle(NarrationEvent::Retarget(Some(target(7)))));
        assert!(n_token.is_cancelled());
        assert_eq!(second[0].1, ClipKey::new("ch1", 7));

        let late = p.handle(NarrationEvent::FetchResolved {
            request_id: n_id,
            result: Ok(clip(99, 2)),
        });
        assert_eq!(released(&late), vec![99]);
        assert!(played(&late).is_empty());
        assert_eq!(p.active_key(), Some(&ClipKey::new("ch1", 7)));
    }

    #[test]
    fn fetch_failure_uses_fallback_for_that_paragraph_only() {
        let mut p = pipeline(true);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(3)))));
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Err(ServiceError::Transport("reset".into())),
        });
        assert_eq!(p.mode(), NarrationMode::Fallback);
        assert_eq!(p.state(), NarrationState::Speaking);
        let utterance = actions
            .iter()
            .find_map(|a| match a {
                NarrationAction::SpeakFallback { utterance_id, .. } => Some(*utterance_id),
                _ => None,
            })
            .unwrap();

        let actions = p.handle(NarrationEvent::FallbackEnded {
            utterance_id: utterance,
        });
        assert!(matches!(
            &actions[..],
            [NarrationAction::Advance { from }] if from.paragraph_index == 3
        ));

        let actions = p.handle(NarrationEvent::Retarget(Some(target(4))));
        assert_eq!(p.mode(), NarrationMode::Primary);
        assert!(actions.iter().any(|a| matches!(
            a,
            NarrationAction::ModeChanged {
                mode: NarrationMode::Primary,
                ..
            }
        )));
        assert_eq!(fetches(&actions)[0].1, ClipKey::new("ch1", 4));
    }

    #[test]
    fn without_fallback_failed_paragraph_is_skipped_after_grace() {
        let mut p = pipeline(false);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(1)))));
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Err(ServiceError::Status {
                status: 500,
                message: "tts down".into(),
            }),
        });
        let seq = actions
            .iter()
            .find_map(|a| match a {
                NarrationAction::ScheduleGrace { seq, delay } => {
                    assert_eq!(*delay, Duration::from_millis(1500));
                    Some(*seq)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(p.mode(), NarrationMode::Primary);
        assert!(p.handle(NarrationEvent::GraceElapsed { seq: seq + 1 }).is_empty());
        let actions = p.handle(NarrationEvent::GraceElapsed { seq });
        assert!(matches!(&actions[..], [NarrationAction::Advance { .. }]));
    }

    #[test]
    fn prefetched_clip_is_reused_for_next_paragraph() {
        let mut p = pipeline(true);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(0)))));
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Ok(clip(1, 0)),
        });
        let prefetch = fetches(&actions);
        p.handle(NarrationEvent::FetchResolved {
            request_id: prefetch[0].0,
            result: Ok(clip(2, 1)),
        });

        let ended = p.handle(NarrationEvent::PlaybackEnded { clip_id: 1 });
        assert_eq!(released(&ended), vec![1]);
        assert!(ended.iter().any(|a| matches!(a, NarrationAction::Advance { .. })));

        let actions = p.handle(NarrationEvent::Retarget(Some(target(1))));
        assert_eq!(played(&actions), vec![2]);
        let next = fetches(&actions);
        assert_eq!(next.len(), 1, "only the following prefetch is issued");
        assert_eq!(next[0].1, ClipKey::new("ch1", 2));
    }

    #[test]
    fn stop_releases_every_clip_exactly_once() {
        let mut p = pipeline(true);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(0)))));
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Ok(clip(1, 0)),
        });
        let prefetch = fetches(&actions);
        p.handle(NarrationEvent::FetchResolved {
            request_id: prefetch[0].0,
            result: Ok(clip(2, 1)),
        });

        let actions = p.handle(NarrationEvent::Stop);
        let mut ids = released(&actions);
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, NarrationAction::StopPlayback { clip_id: 1 })));
        assert!(p.handle(NarrationEvent::Stop).is_empty());
        assert!(p.handle(NarrationEvent::PlaybackEnded { clip_id: 1 }).is_empty());
    }

    #[test]
    fn pending_prefetch_for_other_paragraph_is_cancelled_on_jump() {
        let mut p = pipeline(true);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(0)))));
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Ok(clip(1, 0)),
        });
        let prefetch_token = fetches(&actions)[0].2.clone();
        p.handle(NarrationEvent::Retarget(Some(target(9))));
        assert!(prefetch_token.is_cancelled());
    }

    #[test]
    fn pause_while_fetching_defers_playback_until_resume() {
        let mut p = pipeline(true);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(0)))));
        p.handle(NarrationEvent::Pause);
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Ok(clip(5, 0)),
        });
        assert!(played(&actions).is_empty());
        assert!(fetches(&actions).is_empty());

        let actions = p.handle(NarrationEvent::Resume);
        assert_eq!(played(&actions), vec![5]);
        assert_eq!(fetches(&actions).len(), 1);

        let actions = p.handle(NarrationEvent::Pause);
        assert!(actions
            .iter()
            .any(|a| matches!(a, NarrationAction::PausePlayback { clip_id: 5 })));
        let actions = p.handle(NarrationEvent::Resume);
        assert!(actions
            .iter()
            .any(|a| matches!(a, NarrationAction::ResumePlayback { clip_id: 5 })));
    }

    #[test]
    fn blank_paragraph_is_skipped() {
        let mut p = pipeline(true);
        let mut blank = target(4);
        blank.text = "   ".into();
        let actions = p.handle(NarrationEvent::Start(Some(blank)));
        assert!(fetches(&actions).is_empty());
        assert!(actions.iter().any(
            |a| matches!(a, NarrationAction::Advance { from } if from.paragraph_index == 4)
        ));
    }

    #[test]
    fn voice_change_invalidates_prefetch() {
        let mut p = pipeline(true);
        let fetch = fetches(&p.handle(NarrationEvent::Start(Some(target(0)))));
        let actions = p.handle(NarrationEvent::FetchResolved {
            request_id: fetch[0].0,
            result: Ok(clip(1, 0)),
        });
        p.handle(NarrationEvent::FetchResolved {
            request_id: fetches(&actions)[0].0,
            result: Ok(clip(2, 1)),
        });
        let actions = p.handle(NarrationEvent::VoiceChanged(VoiceParams {
            voice: "alto".into(),
            speed: 1.2,
        }));
        assert_eq!(released(&actions), vec![2]);
        assert!(p.prefetched_key().is_none());
    }

    #[test]
    fn primary_unavailable_goes_straight_to_fallback() {
        let mut p = pipeline(true);
        p.handle(NarrationEvent::SetPrimaryAvailable(false));
        let actions = p.handle(NarrationEvent::Start(Some(target(0))));
        assert_eq!(p.mode(), NarrationMode::Fallback);
        assert!(fetches(&actions).is_empty());
        assert!(actions
            .iter()
            .any(|a| matches!(a, NarrationAction::SpeakFallback { .. })));
    }

    #[test]
    fn nothing_to_narrate_with_no_primary_or_fallback() {
        let mut p = pipeline(false);
        p.handle(NarrationEvent::SetPrimaryAvailable(false));
        assert!(p.handle(NarrationEvent::Start(Some(target(0)))).is_empty());
        assert_eq!(p.state(), NarrationState::Stopped);
    }
}
