//! Timed stand-in for a sound device.
//!
//! Clips "play" for as long as their PCM payload would take at 16 kHz mono
//! 16-bit; speech lasts as long as its words take at the base narration
//! rate. Completions are reported through the session's sink.

use quire_core::cancellation::CancellationToken;
use quire_core::narration::{AudioClip, ClipKey};
use quire_core::runtime::{AudioOutput, CompletionSink};
use quire_core::session::Completion;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const PCM_BYTES_PER_SEC: f64 = 32_000.0;
const BASE_WPM: f64 = 170.0;
const MIN_CLIP: Duration = Duration::from_millis(250);

struct Playing {
    remaining: Duration,
    started: Option<Instant>,
    timer: Scheduled,
    sink: CompletionSink,
}

/// A cancellable delayed action.
struct Scheduled {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Scheduled {
    fn after(delay: Duration, action: impl FnOnce() + Send + 'static) -> Self {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = waiter.cancelled() => {}
                _ = tokio::time::sleep(delay) => action(),
            }
        });
        Self { token, task }
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

#[derive(Default)]
pub struct SimulatedAudio {
    clips: HashMap<u64, Playing>,
    speech: HashMap<u64, Scheduled>,
}

impl SimulatedAudio {
    fn clip_length(bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / PCM_BYTES_PER_SEC).max(MIN_CLIP)
    }

    fn speech_length(text: &str) -> Duration {
        let words = text.split_whitespace().count().max(1) as f64;
        Duration::from_secs_f64(words * 60.0 / BASE_WPM)
    }

    /// Forget utterances that already ran to completion.
    fn prune_speech(&mut self) {
        self.speech.retain(|_, utterance| !utterance.task.is_finished());
    }
}

fn finish_after(delay: Duration, sink: CompletionSink, done: Completion) -> Scheduled {
    Scheduled::after(delay, move || sink.send(done))
}

impl AudioOutput for SimulatedAudio {
    fn play(&mut self, clip_id: u64, key: &ClipKey, data: Arc<[u8]>, sink: CompletionSink) {
        let remaining = Self::clip_length(data.len());
        info!(clip_id, %key, secs = remaining.as_secs_f32(), "Playing narration clip");
        let timer = finish_after(remaining, sink.clone(), Completion::PlaybackEnded { clip_id });
        if let Some(previous) = self.clips.insert(
            clip_id,
            Playing {
                remaining,
                started: Some(Instant::now()),
                timer,
                sink,
            },
        ) {
            previous.timer.cancel();
        }
    }

    fn pause(&mut self, clip_id: u64) {
        let Some(playing) = self.clips.get_mut(&clip_id) else {
            return;
        };
        if let Some(started) = playing.started.take() {
            playing.timer.cancel();
            playing.remaining = playing.remaining.saturating_sub(started.elapsed());
            debug!(clip_id, left_ms = playing.remaining.as_millis() as u64, "Paused clip");
        }
    }

    fn resume(&mut self, clip_id: u64) {
        let Some(playing) = self.clips.get_mut(&clip_id) else {
            return;
        };
        if playing.started.is_none() {
            playing.timer = finish_after(
                playing.remaining,
                playing.sink.clone(),
                Completion::PlaybackEnded { clip_id },
            );
            playing.started = Some(Instant::now());
            debug!(clip_id, "Resumed clip");
        }
    }

    fn stop(&mut self, clip_id: u64) {
        if let Some(playing) = self.clips.get_mut(&clip_id) {
            playing.timer.cancel();
            playing.started = None;
        }
    }

    fn release(&mut self, clip: AudioClip) {
        if let Some(playing) = self.clips.remove(&clip.id()) {
            playing.timer.cancel();
        }
        debug!(clip_id = clip.id(), key = %clip.key(), "Released clip");
    }

    fn speak(&mut self, utterance_id: u64, text: &str, sink: CompletionSink) {
        let length = Self::speech_length(text);
        info!(utterance_id, secs = length.as_secs_f32(), "Speaking with fallback voice");
        self.prune_speech();
        let utterance = finish_after(length, sink, Completion::FallbackEnded { utterance_id });
        self.speech.insert(utterance_id, utterance);
    }

    fn cancel_speech(&mut self, utterance_id: u64) {
        if let Some(utterance) = self.speech.remove(&utterance_id) {
            utterance.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_length_follows_pcm_rate() {
        assert_eq!(SimulatedAudio::clip_length(64_000), Duration::from_secs(2));
        assert_eq!(SimulatedAudio::clip_length(10), MIN_CLIP);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_utterances_are_forgotten() {
        let mut audio = SimulatedAudio::default();
        audio.speech.insert(1, Scheduled::after(Duration::from_millis(10), || {}));
        audio.speech.insert(2, Scheduled::after(Duration::from_secs(30), || {}));
        tokio::time::sleep(Duration::from_secs(1)).await;

        audio.prune_speech();
        assert_eq!(audio.speech.keys().copied().collect::<Vec<_>>(), vec![2]);
        audio.cancel_speech(2);
        assert!(audio.speech.is_empty());
    }

    #[test]
    fn speech_length_follows_word_count() {
        let length = SimulatedAudio::speech_length(&"word ".repeat(170));
        assert_eq!(length, Duration::from_secs(60));
    }
}
