//! Tokio driver for a [`SessionController`].
//!
//! The runtime owns the controller and is the only place that awaits. It
//! carries out effects (service calls, timers, audio), and feeds completions
//! back through one inbound channel so the controller sees a single ordered
//! stream of inputs.

use crate::cancellation::CancellationToken;
use crate::narration::{AudioClip, ClipKey};
use crate::service::ReadingService;
use crate::session::{
    AudioCommand, Completion, Effect, SessionCommand, SessionController, SessionEvent, TimerKey,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Platform audio. Implementations report the end of playback and speech
/// through the given sink.
pub trait AudioOutput: Send + 'static {
    fn play(&mut self, clip_id: u64, key: &ClipKey, data: Arc<[u8]>, sink: CompletionSink);
    fn pause(&mut self, clip_id: u64);
    fn resume(&mut self, clip_id: u64);
    fn stop(&mut self, clip_id: u64);
    /// Free a clip. Called exactly once for every clip the session produced.
    fn release(&mut self, clip: AudioClip);
    fn speak(&mut self, utterance_id: u64, text: &str, sink: CompletionSink);
    fn cancel_speech(&mut self, utterance_id: u64);
}

enum Inbound {
    Command(SessionCommand),
    Completion(Completion),
    Timer {
        key: TimerKey,
        seq: u64,
        generation: u64,
    },
    Shutdown,
}

/// Sender for asynchronous results from audio back-ends.
#[derive(Clone)]
pub struct CompletionSink {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl CompletionSink {
    pub fn send(&self, completion: Completion) {
        if self.tx.send(Inbound::Completion(completion)).is_err() {
            debug!("Session runtime gone; dropping completion");
        }
    }
}

/// Host-side handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl SessionHandle {
    /// Queue a command. Returns false once the runtime has stopped.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(Inbound::Command(command)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Inbound::Shutdown);
    }
}

pub struct SessionRuntime<S, A> {
    controller: SessionController,
    service: Arc<S>,
    audio: A,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    timers: HashMap<TimerKey, (u64, CancellationToken)>,
    timer_generation: u64,
    clip_seq: u64,
    shutdown: CancellationToken,
}

impl<S: ReadingService, A: AudioOutput> SessionRuntime<S, A> {
    pub fn new(
        controller: SessionController,
        service: Arc<S>,
        audio: A,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle { tx: tx.clone() };
        let runtime = Self {
            controller,
            service,
            audio,
            tx,
            rx,
            events,
            timers: HashMap::new(),
            timer_generation: 0,
            clip_seq: 0,
            shutdown: CancellationToken::new(),
        };
        (runtime, handle, events_rx)
    }

    /// Open the book and process inputs until [`SessionHandle::shutdown`].
    pub async fn run(mut self) {
        let effects = self.controller.open();
        self.execute(effects);

        while let Some(inbound) = self.rx.recv().await {
            let now = tokio::time::Instant::now().into_std();
            let effects = match inbound {
                Inbound::Command(command) => self.controller.handle_command(command, now),
                Inbound::Completion(completion) => self.controller.handle_completion(completion, now),
                Inbound::Timer {
                    key,
                    seq,
                    generation,
                } => {
                    let current = self.timers.get(&key).map(|(generation, _)| *generation);
                    if current != Some(generation) {
                        debug!(?key, generation, "Dropping superseded timer");
                        continue;
                    }
                    self.timers.remove(&key);
                    self.controller
                        .handle_completion(Completion::TimerFired { key, seq }, now)
                }
                Inbound::Shutdown => break,
            };
            self.execute(effects);
        }

        let effects = self.controller.teardown();
        self.execute(effects);
        self.shutdown.cancel();
        self.drain_closed();
        info!(book_id = %self.controller.book_id(), "Session runtime stopped");
    }

    /// Hand completions still queued at close to the closed controller, which
    /// releases any audio they carry.
    fn drain_closed(&mut self) {
        while let Ok(inbound) = self.rx.try_recv() {
            if let Inbound::Completion(completion) = inbound {
                let now = tokio::time::Instant::now().into_std();
                let effects = self.controller.handle_completion(completion, now);
                self.execute(effects);
            }
        }
    }

    fn sink(&self) -> CompletionSink {
        CompletionSink {
            tx: self.tx.clone(),
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.execute_one(effect);
        }
    }

    fn execute_one(&mut self, effect: Effect) {
        match effect {
            Effect::FetchBook => self.spawn_call(None, |service, book_id| async move {
                Completion::BookLoaded(service.fetch_book(&book_id).await)
            }),
            Effect::FetchFeatures => self.spawn_call(None, |service, book_id| async move {
                Completion::FeaturesLoaded(service.fetch_features(&book_id).await)
            }),
            Effect::FetchChapter {
                request_id,
                chapter_id,
                token,
            } => self.spawn_call(Some(token), move |service, book_id| async move {
                let result = service.fetch_chapter(&book_id, &chapter_id).await;
                Completion::ChapterLoaded { request_id, result }
            }),
            Effect::FetchNarration {
                request_id,
                key,
                voice,
                token,
            } => {
                self.clip_seq = self.clip_seq.wrapping_add(1);
                let clip_id = self.clip_seq;
                self.spawn_call(Some(token), move |service, book_id| async move {
                    let fetched = service.fetch_narration(&book_id, &key, &voice).await;
                    let result = fetched.map(|bytes| AudioClip::new(clip_id, key, bytes));
                    Completion::NarrationFetched { request_id, result }
                });
            }
            Effect::FetchJobStatus { request_id, key } => {
                self.spawn_call(None, move |service, book_id| async move {
                    let result = service.job_status(&book_id, &key).await;
                    Completion::JobStatus { request_id, result }
                })
            }
            Effect::RequestGeneration { request_id, key } => {
                self.spawn_call(None, move |service, book_id| async move {
                    let result = service.request_generation(&book_id, &key).await;
                    Completion::JobCommand { request_id, result }
                })
            }
            Effect::Regenerate {
                request_id,
                key,
                parameter,
            } => self.spawn_call(None, move |service, book_id| async move {
                let result = service.regenerate(&book_id, &key, &parameter).await;
                Completion::JobCommand { request_id, result }
            }),
            Effect::FetchCharactersUpTo {
                request_id,
                chapter_index,
                paragraph_index,
            } => self.spawn_call(None, move |service, book_id| async move {
                let result = service
                    .characters_up_to(&book_id, chapter_index, paragraph_index)
                    .await;
                Completion::CharactersUpTo { request_id, result }
            }),
            Effect::FetchCharactersSince {
                request_id,
                since_unix_ms,
            } => self.spawn_call(None, move |service, book_id| async move {
                let result = service.characters_since(&book_id, since_unix_ms).await;
                Completion::CharactersSince {
                    request_id,
                    result,
                    now_unix_ms: unix_millis(),
                }
            }),
            Effect::SendChat(request) => self.spawn_call(None, move |service, book_id| async move {
                let result = service
                    .chat(&book_id, &request.target, &request.message, &request.history)
                    .await;
                Completion::ChatReply {
                    request_id: request.request_id,
                    result,
                }
            }),
            Effect::Audio(command) => self.execute_audio(command),
            Effect::ScheduleTimer { key, seq, delay } => self.schedule_timer(key, seq, delay),
            Effect::CancelTimer { key } => {
                if let Some((_, token)) = self.timers.remove(&key) {
                    token.cancel();
                }
            }
            Effect::CancelAllTimers => {
                for (_, (_, token)) in self.timers.drain() {
                    token.cancel();
                }
            }
            Effect::Emit(event) => {
                if self.events.send(event).is_err() {
                    debug!("Event receiver dropped; discarding session event");
                }
            }
        }
    }

    fn execute_audio(&mut self, command: AudioCommand) {
        match command {
            AudioCommand::Play { clip_id, key, data } => {
                let sink = self.sink();
                self.audio.play(clip_id, &key, data, sink);
            }
            AudioCommand::Pause { clip_id } => self.audio.pause(clip_id),
            AudioCommand::Resume { clip_id } => self.audio.resume(clip_id),
            AudioCommand::Stop { clip_id } => self.audio.stop(clip_id),
            AudioCommand::Release(clip) => self.audio.release(clip),
            AudioCommand::Speak { utterance_id, text } => {
                let sink = self.sink();
                self.audio.speak(utterance_id, &text, sink);
            }
            AudioCommand::CancelSpeech { utterance_id } => self.audio.cancel_speech(utterance_id),
        }
    }

    /// Run a service call on the tokio runtime. The result is dropped if
    /// `token` (or the session) is cancelled first.
    fn spawn_call<F, Fut>(&self, token: Option<CancellationToken>, call: F)
    where
        F: FnOnce(Arc<S>, String) -> Fut + Send + 'static,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let book_id = self.controller.book_id().to_string();
        let tx = self.tx.clone();
        let token = token.unwrap_or_default();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let completion = tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = token.cancelled() => {
                    debug!("Service call cancelled");
                    return;
                }
                completion = call(service, book_id) => completion,
            };
            if tx.send(Inbound::Completion(completion)).is_err() {
                warn!("Session runtime gone before service call completed");
            }
        });
    }

    fn schedule_timer(&mut self, key: TimerKey, seq: u64, delay: Duration) {
        if let Some((_, previous)) = self.timers.remove(&key) {
            previous.cancel();
        }
        self.timer_generation = self.timer_generation.wrapping_add(1);
        let generation = self.timer_generation;
        let token = CancellationToken::new();
        self.timers.insert(key.clone(), (generation, token.clone()));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Inbound::Timer { key, seq, generation });
                }
            }
        });
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatTarget, ChatTurn};
    use crate::config::AppConfig;
    use crate::error::ServiceError;
    use crate::model::{
        Book, Chapter, CharacterRecord, FeatureFlags, JobKey, JobSnapshot, JobStatus, Paragraph,
        VoiceParams,
    };
    use crate::narration::NarrationState;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;

    struct ScriptedService {
        chapters: usize,
        paragraphs: usize,
        narration_delay: Duration,
    }

    fn narration_only() -> FeatureFlags {
        FeatureFlags {
            narration: true,
            ..FeatureFlags::default()
        }
    }

    impl ReadingService for ScriptedService {
        async fn fetch_book(&self, book_id: &str) -> Result<Book, ServiceError> {
            Ok(Book {
                id: book_id.to_string(),
                title: "Moby-Dick".into(),
                author: "Herman Melville".into(),
                chapters: (0..self.chapters)
                    .map(|i| Chapter {
                        id: format!("c{i}"),
                        title: format!("Chapter {i}"),
                    })
                    .collect(),
                features: narration_only(),
            })
        }

        async fn fetch_features(&self, _book_id: &str) -> Result<FeatureFlags, ServiceError> {
            Ok(narration_only())
        }

        async fn fetch_chapter(&self, _book_id: &str, chapter_id: &str) -> Result<Vec<Paragraph>, ServiceError> {
            Ok((0..self.paragraphs)
                .map(|i| Paragraph::new(format!("{chapter_id} paragraph {i}.")))
                .collect())
        }

        async fn fetch_narration(
            &self,
            _book_id: &str,
            key: &ClipKey,
            _voice: &VoiceParams,
        ) -> Result<Vec<u8>, ServiceError> {
            tokio::time::sleep(self.narration_delay).await;
            Ok(key.to_string().into_bytes())
        }

        async fn job_status(&self, _book_id: &str, _key: &JobKey) -> Result<JobSnapshot, ServiceError> {
            Ok(JobSnapshot::new(JobStatus::Missing))
        }

        async fn request_generation(&self, _book_id: &str, _key: &JobKey) -> Result<JobSnapshot, ServiceError> {
            Ok(JobSnapshot::new(JobStatus::Pending))
        }

        async fn regenerate(
            &self,
            _book_id: &str,
            _key: &JobKey,
            _parameter: &str,
        ) -> Result<JobSnapshot, ServiceError> {
            Ok(JobSnapshot::new(JobStatus::Pending))
        }

        async fn characters_up_to(
            &self,
            _book_id: &str,
            _chapter_index: usize,
            _paragraph_index: usize,
        ) -> Result<Vec<CharacterRecord>, ServiceError> {
            Ok(Vec::new())
        }

        async fn characters_since(
            &self,
            _book_id: &str,
            _since_unix_ms: u64,
        ) -> Result<Vec<CharacterRecord>, ServiceError> {
            Ok(Vec::new())
        }

        async fn chat(
            &self,
            _book_id: &str,
            _target: &ChatTarget,
            message: &str,
            _history: &[ChatTurn],
        ) -> Result<String, ServiceError> {
            Ok(format!("echo: {message}"))
        }
    }

    #[derive(Default)]
    struct AudioLog {
        played: Vec<u64>,
        released: Vec<u64>,
    }

    /// Finishes every clip as soon as it starts.
    #[derive(Clone, Default)]
    struct InstantAudio {
        log: Arc<Mutex<AudioLog>>,
    }

    impl AudioOutput for InstantAudio {
        fn play(&mut self, clip_id: u64, _key: &ClipKey, _data: Arc<[u8]>, sink: CompletionSink) {
            self.log.lock().unwrap().played.push(clip_id);
            sink.send(Completion::PlaybackEnded { clip_id });
        }

        fn pause(&mut self, _clip_id: u64) {}

        fn resume(&mut self, _clip_id: u64) {}

        fn stop(&mut self, _clip_id: u64) {}

        fn release(&mut self, clip: AudioClip) {
            self.log.lock().unwrap().released.push(clip.id());
        }

        fn speak(&mut self, utterance_id: u64, _text: &str, sink: CompletionSink) {
            sink.send(Completion::FallbackEnded { utterance_id });
        }

        fn cancel_speech(&mut self, _utterance_id: u64) {}
    }

    fn start(
        service: ScriptedService,
        audio: InstantAudio,
    ) -> (
        tokio::task::JoinHandle<()>,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let controller = SessionController::new("b1", AppConfig::default(), Box::new(MemoryStore::new()));
        let (runtime, handle, events) = SessionRuntime::new(controller, Arc::new(service), audio);
        (tokio::spawn(runtime.run()), handle, events)
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        wanted: impl Fn(&SessionEvent) -> bool,
    ) {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return;
            }
        }
        panic!("event stream closed before the expected event");
    }

    #[tokio::test(start_paused = true)]
    async fn narrates_across_chapters_and_releases_every_clip() {
        let audio = InstantAudio::default();
        let service = ScriptedService {
            chapters: 2,
            paragraphs: 2,
            narration_delay: Duration::from_millis(40),
        };
        let (task, handle, mut events) = start(service, audio.clone());

        wait_for(&mut events, |event| matches!(event, SessionEvent::CursorChanged { .. })).await;
        assert!(handle.send(SessionCommand::NarrationPlay));
        wait_for(&mut events, |event| {
            matches!(
                event,
                SessionEvent::PlaybackStateChanged {
                    state: NarrationState::Stopped
                }
            )
        })
        .await;
        handle.shutdown();
        task.await.unwrap();

        let log = audio.log.lock().unwrap();
        assert_eq!(log.played.len(), 4);
        let mut played = log.played.clone();
        let mut released = log.released.clone();
        played.sort_unstable();
        released.sort_unstable();
        assert_eq!(played, released);
    }

    #[tokio::test(start_paused = true)]
    async fn clips_queued_behind_shutdown_are_released() {
        let audio = InstantAudio::default();
        let service = ScriptedService {
            chapters: 1,
            paragraphs: 1,
            narration_delay: Duration::ZERO,
        };
        let controller = SessionController::new("b1", AppConfig::default(), Box::new(MemoryStore::new()));
        let (runtime, _handle, _events) = SessionRuntime::new(controller, Arc::new(service), audio.clone());
        let clip = AudioClip::new(7, ClipKey::new("c0", 0), vec![0; 16]);
        assert!(runtime.tx.send(Inbound::Shutdown).is_ok());
        let queued = Inbound::Completion(Completion::NarrationFetched {
            request_id: 1,
            result: Ok(clip),
        });
        assert!(runtime.tx.send(queued).is_ok());

        runtime.run().await;

        let log = audio.log.lock().unwrap();
        assert!(log.played.is_empty());
        assert_eq!(log.released, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_in_flight_fetches() {
        let audio = InstantAudio::default();
        let service = ScriptedService {
            chapters: 1,
            paragraphs: 3,
            narration_delay: Duration::from_secs(3_600),
        };
        let (task, handle, mut events) = start(service, audio.clone());

        wait_for(&mut events, |event| matches!(event, SessionEvent::CursorChanged { .. })).await;
        handle.send(SessionCommand::NarrationPlay);
        wait_for(&mut events, |event| {
            matches!(
                event,
                SessionEvent::PlaybackStateChanged {
                    state: NarrationState::Speaking
                }
            )
        })
        .await;
        handle.shutdown();
        task.await.unwrap();

        assert!(audio.log.lock().unwrap().played.is_empty());
        assert!(!handle.send(SessionCommand::NextPage));
    }
}
