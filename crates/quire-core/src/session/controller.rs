use super::{
    AudioCommand, Completion, Effect, Overlay, PendingChapter, SessionCommand, SessionEvent,
    SessionSnapshot, TimerKey,
};
use crate::cancellation::CancellationToken;
use crate::characters::{CharacterTracker, ToastAction, TrackerAction};
use crate::chat::{ChatSessions, ChatTarget};
use crate::config::AppConfig;
use crate::enrichment::{EnrichmentPoller, PollAction};
use crate::error::ServiceError;
use crate::model::{Book, FeatureFlags, JobKey, JobKind, Paragraph, VoiceParams};
use crate::narration::{
    ClipKey, NarrationAction, NarrationEvent, NarrationPipeline, NarrationState, NarrationTarget,
};
use crate::navigation::{NavOutcome, NavigationCursor, Seek};
use crate::pagination::{ColumnMode, Page, ViewportMetrics, compute_layout, estimate_heights};
use crate::speed_reading::{PacerAction, PacerState, SpeedReadingPacer};
use crate::storage::{self, KeyValueStore};
use crate::text_utils::speakable_text;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Owns one open book: cursor, layout, narration, enrichment jobs, character
/// discovery, speed reading and chat. Every entry point is synchronous and
/// returns the effects the host runtime must carry out.
pub struct SessionController {
    book_id: String,
    store: Box<dyn KeyValueStore>,
    book: Option<Book>,
    features: FeatureFlags,
    features_loaded: bool,
    nav: NavigationCursor,
    paragraphs: Vec<Paragraph>,
    measured_heights: Option<Vec<f32>>,
    column_mode: ColumnMode,
    illustration_mode: bool,
    viewport: ViewportMetrics,
    pending_chapter: Option<PendingChapter>,
    request_seq: u64,
    narration: NarrationPipeline,
    poller: EnrichmentPoller,
    tracker: CharacterTracker,
    pacer: SpeedReadingPacer,
    chats: ChatSessions,
    overlay: Option<Overlay>,
    narration_held: bool,
    pacer_held: bool,
    closed: bool,
    config: AppConfig,
}

impl SessionController {
    pub fn new(book_id: impl Into<String>, config: AppConfig, store: Box<dyn KeyValueStore>) -> Self {
        let book_id = book_id.into();
        let history = storage::load_character_history(store.as_ref(), &book_id);
        Self {
            narration: NarrationPipeline::new(config.narration(), config.voice()),
            poller: EnrichmentPoller::new(config.poller()),
            tracker: CharacterTracker::new(config.tracker(), history),
            pacer: SpeedReadingPacer::new(config.pacer()),
            chats: ChatSessions::new(config.chat_history_turns),
            column_mode: config.column_mode,
            viewport: config.viewport(),
            book_id,
            store,
            book: None,
            features: FeatureFlags::default(),
            features_loaded: false,
            nav: NavigationCursor::new(0),
            paragraphs: Vec::new(),
            measured_heights: None,
            illustration_mode: false,
            pending_chapter: None,
            request_seq: 0,
            overlay: None,
            narration_held: false,
            pacer_held: false,
            closed: false,
            config,
        }
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn open(&mut self) -> Vec<Effect> {
        info!(book_id = %self.book_id, "Opening reading session");
        vec![Effect::FetchBook, Effect::FetchFeatures]
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            book_id: self.book_id.clone(),
            title: self.book.as_ref().map(|book| book.title.clone()),
            chapter_id: self.current_chapter_id().map(str::to_string),
            cursor: self.nav.cursor(),
            page_count: self.nav.page_count(),
            paragraph_count: self.nav.paragraph_count(),
            column_mode: self.effective_column_mode(),
            illustration_mode: self.illustration_mode,
            narration: self.narration.state(),
            narration_mode: self.narration.mode(),
            speed_reading: self.pacer.state(),
            overlay: self.overlay.clone(),
            toasts: self.tracker.toasts(),
            discovered_characters: self.tracker.history().discovered.len(),
        }
    }

    pub fn handle_command(&mut self, command: SessionCommand, now: Instant) -> Vec<Effect> {
        if self.closed {
            debug!(action = command.action(), "Session closed; ignoring command");
            return Vec::new();
        }
        debug!(action = command.action(), "Handling session command");
        let mut fx = Vec::new();
        match command {
            SessionCommand::GetSnapshot => emit(
                &mut fx,
                SessionEvent::Snapshot {
                    snapshot: self.snapshot(),
                },
            ),
            SessionCommand::NextPage => {
                let outcome = self.nav.next_page();
                self.apply_outcome(outcome, true, now, &mut fx);
            }
            SessionCommand::PrevPage => {
                let outcome = self.nav.prev_page();
                self.apply_outcome(outcome, false, now, &mut fx);
            }
            SessionCommand::NextParagraph => {
                let outcome = self.nav.next_paragraph();
                self.apply_outcome(outcome, true, now, &mut fx);
            }
            SessionCommand::PrevParagraph => {
                let outcome = self.nav.prev_paragraph();
                self.apply_outcome(outcome, false, now, &mut fx);
            }
            SessionCommand::NextChapter => {
                let outcome = self.nav.next_chapter();
                let finished = self.nav.at_chapter_end();
                self.apply_outcome(outcome, finished, now, &mut fx);
            }
            SessionCommand::PrevChapter => {
                let outcome = self.nav.prev_chapter();
                self.apply_outcome(outcome, false, now, &mut fx);
            }
            SessionCommand::GotoChapter {
                chapter,
                page,
                paragraph,
            } => {
                let outcome = self.nav.goto_chapter(chapter, Seek::Position { page, paragraph });
                self.apply_outcome(outcome, false, now, &mut fx);
            }
            SessionCommand::SeekParagraph { paragraph } => {
                let outcome = self.nav.seek_paragraph(paragraph);
                self.apply_outcome(outcome, false, now, &mut fx);
            }
            SessionCommand::SetColumnMode { mode } => {
                self.column_mode = mode;
                if !self.illustration_mode {
                    self.measured_heights = None;
                    self.relayout(&mut fx);
                }
            }
            SessionCommand::SetViewport { width, height } => {
                self.viewport.width = width;
                self.viewport.height = height;
                self.measured_heights = None;
                self.relayout(&mut fx);
            }
            SessionCommand::SetParagraphHeights {
                chapter_index,
                heights,
            } => self.set_paragraph_heights(chapter_index, heights, &mut fx),
            SessionCommand::NarrationPlay => {
                self.narration_held = false;
                self.stop_pacer(&mut fx);
                let target = self.narration_target();
                self.drive_narration(NarrationEvent::Start(target), &mut fx);
            }
            SessionCommand::NarrationPause => {
                self.narration_held = false;
                self.drive_narration(NarrationEvent::Pause, &mut fx);
            }
            SessionCommand::NarrationResume => {
                self.narration_held = false;
                self.drive_narration(NarrationEvent::Resume, &mut fx);
            }
            SessionCommand::NarrationStop => {
                self.narration_held = false;
                self.drive_narration(NarrationEvent::Stop, &mut fx);
            }
            SessionCommand::SetVoice { voice, speed } => {
                self.drive_narration(NarrationEvent::VoiceChanged(VoiceParams { voice, speed }), &mut fx);
            }
            SessionCommand::SpeedReadingStart => {
                self.pacer_held = false;
                self.narration_held = false;
                self.drive_narration(NarrationEvent::Stop, &mut fx);
                let paragraph = self.current_paragraph();
                let actions = self
                    .pacer
                    .start(paragraph.as_ref().map(|(key, text)| (key.clone(), text.as_str())));
                self.apply_pacer(actions, &mut fx);
            }
            SessionCommand::SpeedReadingPause => {
                self.pacer_held = false;
                let actions = self.pacer.pause();
                self.apply_pacer(actions, &mut fx);
            }
            SessionCommand::SpeedReadingResume => {
                self.pacer_held = false;
                let actions = self.pacer.resume();
                self.apply_pacer(actions, &mut fx);
            }
            SessionCommand::SpeedReadingStop => self.stop_pacer(&mut fx),
            SessionCommand::SetWpm { wpm } => self.pacer.set_wpm(wpm),
            SessionCommand::OpenOverlay { overlay } => self.open_overlay(overlay, now, &mut fx),
            SessionCommand::CloseOverlay => self.close_overlay(now, &mut fx),
            SessionCommand::SetIllustrationMode { enabled } => {
                self.set_illustration_mode(enabled, now, &mut fx)
            }
            SessionCommand::RequestGeneration { kind } => {
                let tracked = self
                    .poller
                    .view(kind)
                    .is_some_and(|view| Some(&view.key) == self.job_key(kind).as_ref());
                if !tracked {
                    if let Some(key) = self.job_key(kind) {
                        let visible = self.job_visible(kind);
                        let actions = self.poller.open(key, visible, now);
                        self.apply_poll(actions, &mut fx);
                    }
                }
                let actions = self.poller.request_generation(kind);
                self.apply_poll(actions, &mut fx);
            }
            SessionCommand::RegenerateIllustration { parameter } => {
                let actions = self.poller.regenerate(JobKind::Illustration, parameter);
                self.apply_poll(actions, &mut fx);
            }
            SessionCommand::AcceptIllustration => {
                let actions = self.poller.accept_candidate(JobKind::Illustration);
                self.apply_poll(actions, &mut fx);
            }
            SessionCommand::DiscardIllustration => {
                self.poller.discard_candidate(JobKind::Illustration)
            }
            SessionCommand::DismissToast => {
                let actions = self.tracker.dismiss_toast();
                self.apply_tracker(actions, &mut fx);
            }
            SessionCommand::ChatSubmit { target, message } => {
                if let Some(request) = self.chats.submit(target.clone(), &message) {
                    fx.push(Effect::SendChat(request));
                }
                self.emit_chat(&target, &mut fx);
            }
            SessionCommand::ChatRetry { target } => {
                if let Some(request) = self.chats.retry(&target) {
                    fx.push(Effect::SendChat(request));
                }
                self.emit_chat(&target, &mut fx);
            }
        }
        fx
    }

    pub fn handle_completion(&mut self, completion: Completion, now: Instant) -> Vec<Effect> {
        if self.closed {
            // Audio produced after close still has to be freed.
            if let Completion::NarrationFetched { result: Ok(clip), .. } = completion {
                return vec![Effect::Audio(AudioCommand::Release(clip))];
            }
            return Vec::new();
        }
        let mut fx = Vec::new();
        match completion {
            Completion::BookLoaded(result) => self.on_book_loaded(result, &mut fx),
            Completion::FeaturesLoaded(result) => match result {
                Ok(features) => {
                    self.features_loaded = true;
                    self.apply_features(features, &mut fx);
                }
                Err(err) => warn!(book_id = %self.book_id, "Feature flags unavailable; using book defaults: {err}"),
            },
            Completion::ChapterLoaded { request_id, result } => {
                self.on_chapter_loaded(request_id, result, now, &mut fx)
            }
            Completion::NarrationFetched { request_id, result } => {
                self.drive_narration(NarrationEvent::FetchResolved { request_id, result }, &mut fx)
            }
            Completion::PlaybackEnded { clip_id } => {
                self.drive_narration(NarrationEvent::PlaybackEnded { clip_id }, &mut fx)
            }
            Completion::PlaybackFailed { clip_id, reason } => {
                self.drive_narration(NarrationEvent::PlaybackFailed { clip_id, reason }, &mut fx)
            }
            Completion::FallbackEnded { utterance_id } => {
                self.drive_narration(NarrationEvent::FallbackEnded { utterance_id }, &mut fx)
            }
            Completion::FallbackFailed {
                utterance_id,
                reason,
            } => self.drive_narration(
                NarrationEvent::FallbackFailed {
                    utterance_id,
                    reason,
                },
                &mut fx,
            ),
            Completion::JobStatus { request_id, result } => {
                let actions = self.poller.on_status(request_id, result);
                self.apply_poll(actions, &mut fx);
            }
            Completion::JobCommand { request_id, result } => {
                let actions = self.poller.on_command_result(request_id, result);
                self.apply_poll(actions, &mut fx);
            }
            Completion::CharactersUpTo { request_id, result } => {
                let actions = self.tracker.on_up_to(request_id, result);
                self.apply_tracker(actions, &mut fx);
            }
            Completion::CharactersSince {
                request_id,
                result,
                now_unix_ms,
            } => {
                let actions = self.tracker.on_since(request_id, result, now_unix_ms);
                self.apply_tracker(actions, &mut fx);
            }
            Completion::ChatReply { request_id, result } => {
                if let Some(target) = self.chats.on_reply(request_id, result) {
                    self.emit_chat(&target, &mut fx);
                }
            }
            Completion::TimerFired { key, seq } => self.on_timer(key, seq, now, &mut fx),
        }
        fx
    }

    /// Close the session: stop playback, free audio, cancel polling and
    /// timers, and flush durable state. Later calls do nothing.
    pub fn teardown(&mut self) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        info!(book_id = %self.book_id, "Closing reading session");
        let mut fx = Vec::new();
        if let Some(pending) = self.pending_chapter.take() {
            pending.token.cancel();
        }
        self.drive_narration(NarrationEvent::Stop, &mut fx);
        self.stop_pacer(&mut fx);
        let actions = self.poller.clear();
        self.apply_poll(actions, &mut fx);
        let actions = self.tracker.clear_toasts();
        self.apply_tracker(actions, &mut fx);
        if self.nav.is_loaded() {
            self.persist_position();
        }
        storage::save_character_history(self.store.as_ref(), &self.book_id, self.tracker.history());
        fx.push(Effect::CancelAllTimers);
        self.closed = true;
        fx
    }

    fn on_book_loaded(&mut self, result: Result<Book, ServiceError>, fx: &mut Vec<Effect>) {
        let book = match result {
            Ok(book) => book,
            Err(err) => {
                warn!(book_id = %self.book_id, "Failed to load book: {err}");
                notice(fx, format!("Could not open book: {err}"));
                return;
            }
        };
        info!(
            book_id = %book.id,
            title = %book.title,
            chapters = book.chapters.len(),
            "Book loaded"
        );
        self.nav = NavigationCursor::new(book.chapters.len());
        emit(
            fx,
            SessionEvent::BookOpened {
                book_id: self.book_id.clone(),
                title: book.title.clone(),
                chapter_count: book.chapters.len(),
                features: book.features,
            },
        );
        let features = book.features;
        self.book = Some(book);
        if !self.features_loaded {
            self.apply_features(features, fx);
        }
        if self.nav.chapter_count() == 0 {
            notice(fx, "This book has no chapters".to_string());
            return;
        }
        let saved = storage::load_position(self.store.as_ref(), &self.book_id);
        let (chapter, seek) = self.nav.resume(saved);
        self.begin_chapter_load(chapter, seek, fx);
    }

    fn apply_features(&mut self, features: FeatureFlags, fx: &mut Vec<Effect>) {
        debug!(?features, "Applying feature flags");
        let was_enabled = self.features.character;
        self.features = features;
        self.drive_narration(NarrationEvent::SetPrimaryAvailable(features.narration), fx);
        let actions = self.poller.set_features(features);
        self.apply_poll(actions, fx);
        self.tracker.set_enabled(features.character);
        if features.character && !was_enabled && self.nav.is_loaded() {
            let cursor = self.nav.cursor();
            let actions = self
                .tracker
                .cursor_settled(cursor.chapter_index, cursor.paragraph_index);
            self.apply_tracker(actions, fx);
        }
    }

    fn begin_chapter_load(&mut self, chapter_index: usize, seek: Seek, fx: &mut Vec<Effect>) {
        let Some(chapter_id) = self
            .book
            .as_ref()
            .and_then(|book| book.chapter_id(chapter_index))
            .map(str::to_string)
        else {
            warn!(chapter_index, "No chapter at index; ignoring load");
            return;
        };
        if let Some(previous) = self.pending_chapter.take() {
            debug!(request_id = previous.request_id, "Superseding chapter load");
            previous.token.cancel();
        }
        self.request_seq = self.request_seq.wrapping_add(1);
        let request_id = self.request_seq;
        let token = CancellationToken::new();
        info!(chapter = chapter_index, chapter_id = %chapter_id, request_id, "Loading chapter");
        self.pending_chapter = Some(PendingChapter {
            request_id,
            chapter_index,
            seek,
            token: token.clone(),
        });

        // Work tied to the previous paragraph no longer applies.
        self.drive_narration(NarrationEvent::Retarget(None), fx);
        let actions = self.pacer.retarget(None);
        self.apply_pacer(actions, fx);
        let actions = self.poller.context_changed(&chapter_id);
        self.apply_poll(actions, fx);

        fx.push(Effect::FetchChapter {
            request_id,
            chapter_id,
            token,
        });
    }

    fn on_chapter_loaded(
        &mut self,
        request_id: u64,
        result: Result<Vec<Paragraph>, ServiceError>,
        now: Instant,
        fx: &mut Vec<Effect>,
    ) {
        let current = self.pending_chapter.as_ref().map(|pending| pending.request_id);
        if current != Some(request_id) {
            debug!(request_id, ?current, "Ignoring stale chapter load");
            return;
        }
        let Some(pending) = self.pending_chapter.take() else {
            return;
        };
        let paragraphs = match result {
            Ok(paragraphs) => paragraphs,
            Err(err) => {
                warn!(chapter = pending.chapter_index, "Failed to load chapter: {err}");
                notice(fx, format!("Could not load chapter: {err}"));
                self.drive_narration(NarrationEvent::Stop, fx);
                self.stop_pacer(fx);
                self.open_chapter_jobs(now, fx);
                return;
            }
        };

        self.paragraphs = paragraphs;
        self.measured_heights = None;
        let pages = self.layout();
        self.nav
            .load_chapter(pending.chapter_index, self.paragraphs.len(), pages, pending.seek);
        self.persist_position();
        self.emit_layout(fx);
        self.emit_cursor(fx);
        self.after_cursor_move(fx);
        self.open_chapter_jobs(now, fx);
    }

    /// Check every enrichment job for the new chapter once; the ones with a
    /// view on screen keep polling.
    fn open_chapter_jobs(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        for kind in JobKind::ALL {
            let Some(key) = self.job_key(kind) else {
                continue;
            };
            let visible = self.job_visible(kind);
            let actions = self.poller.open(key, visible, now);
            self.apply_poll(actions, fx);
        }
    }

    fn job_key(&self, kind: JobKind) -> Option<JobKey> {
        self.current_chapter_id().map(|chapter_id| JobKey::new(kind, chapter_id))
    }

    fn job_visible(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Illustration => self.illustration_mode,
            _ => self.overlay.as_ref().and_then(Overlay::job_kind) == Some(kind),
        }
    }

    fn apply_outcome(
        &mut self,
        outcome: NavOutcome,
        crossing_end: bool,
        now: Instant,
        fx: &mut Vec<Effect>,
    ) {
        match outcome {
            NavOutcome::Moved => {
                self.abandon_pending_load(now, fx);
                self.persist_position();
                self.emit_cursor(fx);
                self.after_cursor_move(fx);
            }
            NavOutcome::Unchanged => {
                if self.abandon_pending_load(now, fx) {
                    self.emit_cursor(fx);
                    self.after_cursor_move(fx);
                }
            }
            NavOutcome::AtBoundary => debug!("Navigation stopped at book boundary"),
            NavOutcome::ChapterChange {
                chapter_index,
                seek,
            } => {
                if crossing_end {
                    self.emit_chapter_finished(true, fx);
                }
                self.begin_chapter_load(chapter_index, seek, fx);
            }
        }
    }

    /// The reader settled on the chapter already on screen: cancel the load
    /// still heading elsewhere and reattach its enrichment jobs. Narration and
    /// the pacer are retargeted by the caller.
    fn abandon_pending_load(&mut self, now: Instant, fx: &mut Vec<Effect>) -> bool {
        let Some(pending) = self.pending_chapter.take() else {
            return false;
        };
        debug!(
            request_id = pending.request_id,
            chapter = pending.chapter_index,
            "Abandoning chapter load"
        );
        pending.token.cancel();
        self.open_chapter_jobs(now, fx);
        true
    }

    fn emit_chapter_finished(&self, prompt_allowed: bool, fx: &mut Vec<Effect>) {
        let show_overlay_prompt = prompt_allowed && (self.features.recap || self.features.quiz);
        emit(
            fx,
            SessionEvent::ChapterFinished {
                chapter_index: self.nav.cursor().chapter_index,
                show_overlay_prompt,
            },
        );
    }

    fn after_cursor_move(&mut self, fx: &mut Vec<Effect>) {
        if self.narration.is_active() {
            let target = self.narration_target();
            self.drive_narration(NarrationEvent::Retarget(target), fx);
        }
        if self.pacer.is_active() {
            let paragraph = self.current_paragraph();
            let actions = self
                .pacer
                .retarget(paragraph.as_ref().map(|(key, text)| (key.clone(), text.as_str())));
            self.apply_pacer(actions, fx);
        }
        let cursor = self.nav.cursor();
        let actions = self
            .tracker
            .cursor_settled(cursor.chapter_index, cursor.paragraph_index);
        self.apply_tracker(actions, fx);
    }

    /// Playback finished `from`; step the cursor forward without prompting.
    fn advance_playback(&mut self, from: &ClipKey, fx: &mut Vec<Effect>) -> bool {
        let current = self.current_paragraph().map(|(key, _)| key);
        if current.as_ref() != Some(from) {
            debug!(from = %from, "Ignoring advance from a paragraph no longer under the cursor");
            return true;
        }
        match self.nav.next_paragraph() {
            NavOutcome::Moved => {
                self.persist_position();
                self.emit_cursor(fx);
                self.after_cursor_move(fx);
                true
            }
            NavOutcome::Unchanged => true,
            NavOutcome::AtBoundary => {
                info!("Reached the end of the book");
                false
            }
            NavOutcome::ChapterChange {
                chapter_index,
                seek,
            } => {
                self.emit_chapter_finished(false, fx);
                self.begin_chapter_load(chapter_index, seek, fx);
                true
            }
        }
    }

    fn current_chapter_id(&self) -> Option<&str> {
        if !self.nav.is_loaded() {
            return None;
        }
        self.book
            .as_ref()?
            .chapter_id(self.nav.cursor().chapter_index)
    }

    /// Key and raw text under the cursor, or `None` while a chapter loads.
    fn current_paragraph(&self) -> Option<(ClipKey, String)> {
        if self.pending_chapter.is_some() {
            return None;
        }
        let chapter_id = self.current_chapter_id()?;
        let index = self.nav.cursor().paragraph_index;
        let text = self
            .paragraphs
            .get(index)
            .map(|paragraph| paragraph.content.clone())
            .unwrap_or_default();
        Some((ClipKey::new(chapter_id, index), text))
    }

    fn narration_target(&self) -> Option<NarrationTarget> {
        let (key, text) = self.current_paragraph()?;
        let next = (key.paragraph_index + 1 < self.paragraphs.len())
            .then(|| ClipKey::new(key.chapter_id.clone(), key.paragraph_index + 1));
        Some(NarrationTarget {
            key,
            text: speakable_text(&text),
            next,
        })
    }

    fn effective_column_mode(&self) -> ColumnMode {
        if self.illustration_mode {
            ColumnMode::Single
        } else {
            self.column_mode
        }
    }

    fn layout(&self) -> Vec<Page> {
        let mode = self.effective_column_mode();
        let estimated;
        let heights: &[f32] = match &self.measured_heights {
            Some(measured) => measured,
            None => {
                estimated = match self.viewport.column_width(mode) {
                    Some(width) => estimate_heights(&self.paragraphs, &self.config.text_metrics(), width),
                    None => vec![0.0; self.paragraphs.len()],
                };
                &estimated
            }
        };
        compute_layout(heights, Some(&self.viewport), mode)
    }

    fn relayout(&mut self, fx: &mut Vec<Effect>) {
        if !self.nav.is_loaded() {
            return;
        }
        let pages = self.layout();
        let outcome = self.nav.relayout(pages);
        self.emit_layout(fx);
        if outcome == NavOutcome::Moved {
            self.persist_position();
            self.emit_cursor(fx);
        }
    }

    fn set_paragraph_heights(&mut self, chapter_index: usize, heights: Vec<f32>, fx: &mut Vec<Effect>) {
        let current = self.nav.cursor().chapter_index;
        if !self.nav.is_loaded() || chapter_index != current || heights.len() != self.paragraphs.len() {
            warn!(
                chapter_index,
                current,
                heights = heights.len(),
                paragraphs = self.paragraphs.len(),
                "Ignoring measurements that do not match the loaded chapter"
            );
            return;
        }
        self.measured_heights = Some(heights);
        self.relayout(fx);
    }

    fn set_illustration_mode(&mut self, enabled: bool, now: Instant, fx: &mut Vec<Effect>) {
        if self.illustration_mode == enabled {
            return;
        }
        info!(enabled, "Illustration mode toggled");
        self.illustration_mode = enabled;
        self.measured_heights = None;
        self.relayout(fx);
        if enabled {
            if let Some(key) = self.job_key(JobKind::Illustration) {
                let actions = self.poller.open(key, true, now);
                self.apply_poll(actions, fx);
            }
        } else {
            let actions = self.poller.set_visible(JobKind::Illustration, false, now);
            self.apply_poll(actions, fx);
        }
    }

    fn open_overlay(&mut self, overlay: Overlay, now: Instant, fx: &mut Vec<Effect>) {
        if self.overlay.as_ref() == Some(&overlay) {
            return;
        }
        if let Some(previous) = self.overlay.take() {
            self.hide_overlay_job(&previous, now, fx);
        }
        if self.narration.state() == NarrationState::Speaking {
            self.drive_narration(NarrationEvent::Pause, fx);
            self.narration_held = true;
        }
        if self.pacer.state() == PacerState::Running {
            let actions = self.pacer.pause();
            self.apply_pacer(actions, fx);
            self.pacer_held = true;
        }
        self.overlay = Some(overlay.clone());
        if let Some(kind) = overlay.job_kind() {
            if let Some(key) = self.job_key(kind) {
                let actions = self.poller.open(key, true, now);
                self.apply_poll(actions, fx);
            }
        }
        if let Overlay::Chat { target } = &overlay {
            self.emit_chat(target, fx);
        }
        emit(
            fx,
            SessionEvent::OverlayChanged {
                overlay: Some(overlay),
            },
        );
    }

    fn close_overlay(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        let Some(previous) = self.overlay.take() else {
            return;
        };
        self.hide_overlay_job(&previous, now, fx);
        emit(fx, SessionEvent::OverlayChanged { overlay: None });
        if std::mem::take(&mut self.narration_held) {
            self.drive_narration(NarrationEvent::Resume, fx);
        }
        if std::mem::take(&mut self.pacer_held) {
            let actions = self.pacer.resume();
            self.apply_pacer(actions, fx);
        }
    }

    fn hide_overlay_job(&mut self, overlay: &Overlay, now: Instant, fx: &mut Vec<Effect>) {
        if let Some(kind) = overlay.job_kind() {
            let actions = self.poller.set_visible(kind, false, now);
            self.apply_poll(actions, fx);
        }
    }

    fn stop_pacer(&mut self, fx: &mut Vec<Effect>) {
        self.pacer_held = false;
        let actions = self.pacer.stop();
        self.apply_pacer(actions, fx);
    }

    fn on_timer(&mut self, key: TimerKey, seq: u64, now: Instant, fx: &mut Vec<Effect>) {
        match key {
            TimerKey::NarrationGrace => {
                self.drive_narration(NarrationEvent::GraceElapsed { seq }, fx)
            }
            TimerKey::JobPoll(job) => {
                let actions = self.poller.on_tick(&job, now);
                self.apply_poll(actions, fx);
            }
            TimerKey::CharacterDebounce => {
                let actions = self.tracker.on_debounce(seq);
                self.apply_tracker(actions, fx);
            }
            TimerKey::CharacterPoll => {
                let actions = self.tracker.on_poll_tick();
                self.apply_tracker(actions, fx);
            }
            TimerKey::ToastDismiss => {
                let actions = self.tracker.on_toast_timer(seq);
                self.apply_tracker(actions, fx);
            }
            TimerKey::SpeedReadingWord => {
                let actions = self.pacer.on_tick(seq);
                self.apply_pacer(actions, fx);
            }
        }
    }

    fn drive_narration(&mut self, event: NarrationEvent, fx: &mut Vec<Effect>) {
        for action in self.narration.handle(event) {
            match action {
                NarrationAction::Fetch {
                    request_id,
                    key,
                    voice,
                    token,
                    prefetch,
                } => {
                    debug!(key = %key, request_id, prefetch, "Queueing narration fetch");
                    fx.push(Effect::FetchNarration {
                        request_id,
                        key,
                        voice,
                        token,
                    });
                }
                NarrationAction::Play { clip_id, key, data } => {
                    fx.push(Effect::Audio(AudioCommand::Play { clip_id, key, data }))
                }
                NarrationAction::PausePlayback { clip_id } => {
                    fx.push(Effect::Audio(AudioCommand::Pause { clip_id }))
                }
                NarrationAction::ResumePlayback { clip_id } => {
                    fx.push(Effect::Audio(AudioCommand::Resume { clip_id }))
                }
                NarrationAction::StopPlayback { clip_id } => {
                    fx.push(Effect::Audio(AudioCommand::Stop { clip_id }))
                }
                NarrationAction::Release(clip) => fx.push(Effect::Audio(AudioCommand::Release(clip))),
                NarrationAction::SpeakFallback {
                    utterance_id, text, ..
                } => fx.push(Effect::Audio(AudioCommand::Speak { utterance_id, text })),
                NarrationAction::CancelFallback { utterance_id } => {
                    fx.push(Effect::Audio(AudioCommand::CancelSpeech { utterance_id }))
                }
                NarrationAction::ScheduleGrace { seq, delay } => fx.push(Effect::ScheduleTimer {
                    key: TimerKey::NarrationGrace,
                    seq,
                    delay,
                }),
                NarrationAction::Advance { from } => {
                    if !self.advance_playback(&from, fx) {
                        self.drive_narration(NarrationEvent::Stop, fx);
                    }
                }
                NarrationAction::ModeChanged { mode, key } => emit(
                    fx,
                    SessionEvent::PlaybackModeChanged {
                        mode,
                        chapter_id: key.as_ref().map(|key| key.chapter_id.clone()),
                        paragraph_index: key.map(|key| key.paragraph_index),
                    },
                ),
                NarrationAction::StateChanged(state) => {
                    emit(fx, SessionEvent::PlaybackStateChanged { state })
                }
            }
        }
    }

    fn apply_pacer(&mut self, actions: Vec<PacerAction>, fx: &mut Vec<Effect>) {
        for action in actions {
            match action {
                PacerAction::ShowWord { key, index, word } => emit(
                    fx,
                    SessionEvent::SpeedReadingWord {
                        chapter_id: key.chapter_id,
                        paragraph_index: key.paragraph_index,
                        index,
                        word,
                    },
                ),
                PacerAction::ScheduleNext { seq, delay } => fx.push(Effect::ScheduleTimer {
                    key: TimerKey::SpeedReadingWord,
                    seq,
                    delay,
                }),
                PacerAction::Advance { from } => {
                    if !self.advance_playback(&from, fx) {
                        self.stop_pacer(fx);
                    }
                }
                PacerAction::StateChanged(state) => {
                    emit(fx, SessionEvent::SpeedReadingStateChanged { state })
                }
            }
        }
    }

    fn apply_poll(&mut self, actions: Vec<PollAction>, fx: &mut Vec<Effect>) {
        for action in actions {
            match action {
                PollAction::FetchStatus { request_id, key } => {
                    fx.push(Effect::FetchJobStatus { request_id, key })
                }
                PollAction::RequestGeneration { request_id, key } => {
                    fx.push(Effect::RequestGeneration { request_id, key })
                }
                PollAction::Regenerate {
                    request_id,
                    key,
                    parameter,
                } => fx.push(Effect::Regenerate {
                    request_id,
                    key,
                    parameter,
                }),
                PollAction::ScheduleTick { key, delay } => fx.push(Effect::ScheduleTimer {
                    key: TimerKey::JobPoll(key),
                    seq: 0,
                    delay,
                }),
                PollAction::CancelTick { key } => fx.push(Effect::CancelTimer {
                    key: TimerKey::JobPoll(key),
                }),
                PollAction::StatusChanged { key, status } => {
                    emit(fx, SessionEvent::JobStatusChanged { job: key, status })
                }
                PollAction::Ready { key, payload } => {
                    emit(fx, SessionEvent::GenerationReady { job: key, payload })
                }
                PollAction::CandidateReady { key, payload } => {
                    emit(fx, SessionEvent::GenerationCandidate { job: key, payload })
                }
                PollAction::Accepted { key, payload } => {
                    emit(fx, SessionEvent::GenerationAccepted { job: key, payload })
                }
                PollAction::Failed { key, reason } => {
                    emit(fx, SessionEvent::GenerationFailed { job: key, reason })
                }
            }
        }
    }

    fn apply_tracker(&mut self, actions: Vec<TrackerAction>, fx: &mut Vec<Effect>) {
        for action in actions {
            match action {
                TrackerAction::ScheduleDebounce { seq, delay } => fx.push(Effect::ScheduleTimer {
                    key: TimerKey::CharacterDebounce,
                    seq,
                    delay,
                }),
                TrackerAction::FetchUpTo {
                    request_id,
                    chapter_index,
                    paragraph_index,
                } => fx.push(Effect::FetchCharactersUpTo {
                    request_id,
                    chapter_index,
                    paragraph_index,
                }),
                TrackerAction::FetchSince {
                    request_id,
                    since_unix_ms,
                } => fx.push(Effect::FetchCharactersSince {
                    request_id,
                    since_unix_ms,
                }),
                TrackerAction::SchedulePoll { delay } => fx.push(Effect::ScheduleTimer {
                    key: TimerKey::CharacterPoll,
                    seq: 0,
                    delay,
                }),
                TrackerAction::Persist => storage::save_character_history(
                    self.store.as_ref(),
                    &self.book_id,
                    self.tracker.history(),
                ),
                TrackerAction::Discovered(characters) => {
                    emit(fx, SessionEvent::CharactersDiscovered { characters })
                }
                TrackerAction::Toast(ToastAction::ScheduleDismiss { generation, delay }) => {
                    fx.push(Effect::ScheduleTimer {
                        key: TimerKey::ToastDismiss,
                        seq: generation,
                        delay,
                    })
                }
                TrackerAction::Toast(ToastAction::CancelDismiss) => fx.push(Effect::CancelTimer {
                    key: TimerKey::ToastDismiss,
                }),
                TrackerAction::Toast(ToastAction::Changed(toasts)) => {
                    emit(fx, SessionEvent::ToastQueueChanged { toasts })
                }
            }
        }
    }

    fn persist_position(&self) {
        storage::save_position(self.store.as_ref(), &self.book_id, &self.nav.cursor());
    }

    fn emit_cursor(&self, fx: &mut Vec<Effect>) {
        let Some(chapter_id) = self.current_chapter_id() else {
            return;
        };
        let cursor = self.nav.cursor();
        emit(
            fx,
            SessionEvent::CursorChanged {
                chapter_id: chapter_id.to_string(),
                chapter_index: cursor.chapter_index,
                page_index: cursor.page_index,
                paragraph_index: cursor.paragraph_index,
                page_count: self.nav.page_count(),
            },
        );
    }

    fn emit_layout(&self, fx: &mut Vec<Effect>) {
        let Some(chapter_id) = self.current_chapter_id() else {
            return;
        };
        emit(
            fx,
            SessionEvent::LayoutChanged {
                chapter_id: chapter_id.to_string(),
                page_count: self.nav.page_count(),
                column_mode: self.effective_column_mode(),
            },
        );
    }

    fn emit_chat(&self, target: &ChatTarget, fx: &mut Vec<Effect>) {
        emit(
            fx,
            SessionEvent::ChatUpdated {
                chat: self.chats.snapshot(target),
            },
        );
    }
}

fn emit(fx: &mut Vec<Effect>, event: SessionEvent) {
    fx.push(Effect::Emit(event));
}

fn notice(fx: &mut Vec<Effect>, message: String) {
    emit(fx, SessionEvent::Notice { message });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatKind;
    use crate::model::Chapter;
    use crate::narration::AudioClip;
    use crate::navigation::Cursor;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn book(chapters: usize) -> Book {
        Book {
            id: "b1".into(),
            title: "Moby-Dick".into(),
            author: "Herman Melville".into(),
            chapters: (0..chapters)
                .map(|i| Chapter {
                    id: format!("c{i}"),
                    title: format!("Chapter {i}"),
                })
                .collect(),
            features: FeatureFlags {
                narration: true,
                illustration: true,
                character: false,
                recap: true,
                quiz: true,
            },
        }
    }

    fn paragraphs(count: usize) -> Vec<Paragraph> {
        (0..count)
            .map(|i| Paragraph::new(format!("Paragraph {i} of the voyage.")))
            .collect()
    }

    fn controller(store: Arc<MemoryStore>) -> SessionController {
        SessionController::new("b1", AppConfig::default(), Box::new(store))
    }

    fn chapter_request(fx: &[Effect]) -> Option<(u64, String, CancellationToken)> {
        fx.iter().find_map(|effect| match effect {
            Effect::FetchChapter {
                request_id,
                chapter_id,
                token,
            } => Some((*request_id, chapter_id.clone(), token.clone())),
            _ => None,
        })
    }

    fn narration_fetches(fx: &[Effect]) -> Vec<(u64, ClipKey, CancellationToken)> {
        fx.iter()
            .filter_map(|effect| match effect {
                Effect::FetchNarration {
                    request_id,
                    key,
                    token,
                    ..
                } => Some((*request_id, key.clone(), token.clone())),
                _ => None,
            })
            .collect()
    }

    fn events(fx: &[Effect]) -> Vec<&SessionEvent> {
        fx.iter()
            .filter_map(|effect| match effect {
                Effect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn load_pending_chapter(ctrl: &mut SessionController, fx: &[Effect], count: usize) -> Vec<Effect> {
        let (request_id, _, _) = chapter_request(fx).expect("chapter fetch");
        ctrl.handle_completion(
            Completion::ChapterLoaded {
                request_id,
                result: Ok(paragraphs(count)),
            },
            Instant::now(),
        )
    }

    fn opened(store: Arc<MemoryStore>, chapters: usize, per_chapter: usize) -> SessionController {
        let mut ctrl = controller(store);
        assert!(matches!(
            ctrl.open().as_slice(),
            [Effect::FetchBook, Effect::FetchFeatures]
        ));
        let fx = ctrl.handle_completion(Completion::BookLoaded(Ok(book(chapters))), Instant::now());
        load_pending_chapter(&mut ctrl, &fx, per_chapter);
        ctrl
    }

    #[test]
    fn resumes_saved_position_and_persists_moves() {
        let store = Arc::new(MemoryStore::new());
        let saved = Cursor {
            chapter_index: 1,
            page_index: 0,
            paragraph_index: 2,
        };
        storage::save_position(store.as_ref(), "b1", &saved);

        let mut ctrl = controller(store.clone());
        ctrl.open();
        let fx = ctrl.handle_completion(Completion::BookLoaded(Ok(book(3))), Instant::now());
        let (_, chapter_id, _) = chapter_request(&fx).unwrap();
        assert_eq!(chapter_id, "c1");

        let fx = load_pending_chapter(&mut ctrl, &fx, 5);
        assert!(events(&fx).iter().any(|event| matches!(
            event,
            SessionEvent::CursorChanged {
                chapter_index: 1,
                paragraph_index: 2,
                ..
            }
        )));

        ctrl.handle_command(SessionCommand::NextParagraph, Instant::now());
        let stored = storage::load_position(store.as_ref(), "b1").unwrap();
        assert_eq!(stored.chapter_index, 1);
        assert_eq!(stored.paragraph_index, 3);
    }

    #[test]
    fn superseded_chapter_load_is_cancelled_and_ignored() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 3, 2);
        let first = ctrl.handle_command(SessionCommand::NextChapter, Instant::now());
        let (first_id, _, first_token) = chapter_request(&first).unwrap();
        let second = ctrl.handle_command(SessionCommand::GotoChapter {
            chapter: 2,
            page: 0,
            paragraph: 0,
        }, Instant::now());
        let (second_id, chapter_id, _) = chapter_request(&second).unwrap();
        assert!(first_token.is_cancelled());
        assert_eq!(chapter_id, "c2");

        let late = ctrl.handle_completion(
            Completion::ChapterLoaded {
                request_id: first_id,
                result: Ok(paragraphs(2)),
            },
            Instant::now(),
        );
        assert!(late.is_empty());

        ctrl.handle_completion(
            Completion::ChapterLoaded {
                request_id: second_id,
                result: Ok(paragraphs(2)),
            },
            Instant::now(),
        );
        assert_eq!(ctrl.snapshot().cursor.chapter_index, 2);
    }

    #[test]
    fn goto_current_chapter_abandons_pending_load() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 3, 4);
        ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        let pending = ctrl.handle_command(SessionCommand::NextChapter, Instant::now());
        let (request_id, chapter_id, token) = chapter_request(&pending).unwrap();
        assert_eq!(chapter_id, "c1");

        let fx = ctrl.handle_command(
            SessionCommand::GotoChapter {
                chapter: 0,
                page: 0,
                paragraph: 2,
            },
            Instant::now(),
        );
        assert!(token.is_cancelled());
        assert!(narration_fetches(&fx)
            .iter()
            .any(|(_, key, _)| *key == ClipKey::new("c0", 2)));
        assert!(fx.iter().any(|effect| matches!(
            effect,
            Effect::FetchJobStatus { key, .. } if key.chapter_id == "c0"
        )));

        let late = ctrl.handle_completion(
            Completion::ChapterLoaded {
                request_id,
                result: Ok(paragraphs(4)),
            },
            Instant::now(),
        );
        assert!(late.is_empty());
        let cursor = ctrl.snapshot().cursor;
        assert_eq!((cursor.chapter_index, cursor.paragraph_index), (0, 2));
    }

    #[test]
    fn seek_during_pending_load_keeps_the_current_chapter() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 3, 4);
        let pending = ctrl.handle_command(SessionCommand::NextChapter, Instant::now());
        let (request_id, _, token) = chapter_request(&pending).unwrap();

        let fx = ctrl.handle_command(SessionCommand::SeekParagraph { paragraph: 3 }, Instant::now());
        assert!(token.is_cancelled());
        assert!(events(&fx).iter().any(|event| matches!(
            event,
            SessionEvent::CursorChanged {
                chapter_index: 0,
                paragraph_index: 3,
                ..
            }
        )));

        let late = ctrl.handle_completion(
            Completion::ChapterLoaded {
                request_id,
                result: Ok(paragraphs(4)),
            },
            Instant::now(),
        );
        assert!(late.is_empty());
        let cursor = ctrl.snapshot().cursor;
        assert_eq!((cursor.chapter_index, cursor.paragraph_index), (0, 3));
    }

    #[test]
    fn failed_chapter_load_reopens_current_jobs() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 3, 2);
        let pending = ctrl.handle_command(SessionCommand::NextChapter, Instant::now());
        let (request_id, _, _) = chapter_request(&pending).unwrap();

        let fx = ctrl.handle_completion(
            Completion::ChapterLoaded {
                request_id,
                result: Err(ServiceError::Transport("connection reset".into())),
            },
            Instant::now(),
        );
        assert!(events(&fx)
            .iter()
            .any(|event| matches!(event, SessionEvent::Notice { .. })));
        assert!(fx.iter().any(|effect| matches!(
            effect,
            Effect::FetchJobStatus { key, .. } if key.chapter_id == "c0"
        )));
        assert_eq!(ctrl.snapshot().cursor.chapter_index, 0);
    }

    #[test]
    fn moving_the_cursor_cancels_the_narration_fetch() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 1, 3);
        let fx = ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        let fetches = narration_fetches(&fx);
        assert_eq!(fetches.len(), 1);
        let (_, key, token) = fetches[0].clone();
        assert_eq!(key, ClipKey::new("c0", 0));

        let fx = ctrl.handle_command(SessionCommand::NextParagraph, Instant::now());
        assert!(token.is_cancelled());
        let fetches = narration_fetches(&fx);
        assert_eq!(fetches[0].1, ClipKey::new("c0", 1));
    }

    #[test]
    fn narrated_chapter_end_skips_the_prompt_but_manual_does_not() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 2, 1);
        let fx = ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        let (request_id, key, _) = narration_fetches(&fx)[0].clone();
        let fx = ctrl.handle_completion(
            Completion::NarrationFetched {
                request_id,
                result: Ok(AudioClip::new(7, key, vec![0; 16])),
            },
            Instant::now(),
        );
        assert!(fx
            .iter()
            .any(|effect| matches!(effect, Effect::Audio(AudioCommand::Play { clip_id: 7, .. }))));

        let fx = ctrl.handle_completion(Completion::PlaybackEnded { clip_id: 7 }, Instant::now());
        assert!(events(&fx).contains(&&SessionEvent::ChapterFinished {
            chapter_index: 0,
            show_overlay_prompt: false,
        }));
        assert!(fx
            .iter()
            .any(|effect| matches!(effect, Effect::Audio(AudioCommand::Release(clip)) if clip.id() == 7)));
        let fx = load_pending_chapter(&mut ctrl, &fx, 1);
        assert_eq!(narration_fetches(&fx)[0].1, ClipKey::new("c1", 0));

        ctrl.handle_command(SessionCommand::NarrationStop, Instant::now());
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 2, 1);
        let fx = ctrl.handle_command(SessionCommand::NextPage, Instant::now());
        assert!(events(&fx).contains(&&SessionEvent::ChapterFinished {
            chapter_index: 0,
            show_overlay_prompt: true,
        }));
    }

    #[test]
    fn overlay_pauses_and_restores_only_running_narration() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 1, 3);
        ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        let fx = ctrl.handle_command(
            SessionCommand::OpenOverlay {
                overlay: Overlay::Recap,
            },
            Instant::now(),
        );
        assert!(events(&fx).contains(&&SessionEvent::PlaybackStateChanged {
            state: NarrationState::Paused
        }));
        assert!(fx.iter().any(|effect| matches!(
            effect,
            Effect::FetchJobStatus { key, .. } if key.kind == JobKind::Recap
        )));

        let fx = ctrl.handle_command(SessionCommand::CloseOverlay, Instant::now());
        assert!(events(&fx).contains(&&SessionEvent::PlaybackStateChanged {
            state: NarrationState::Speaking
        }));

        ctrl.handle_command(SessionCommand::NarrationPause, Instant::now());
        ctrl.handle_command(
            SessionCommand::OpenOverlay {
                overlay: Overlay::Quiz,
            },
            Instant::now(),
        );
        ctrl.handle_command(SessionCommand::CloseOverlay, Instant::now());
        assert_eq!(ctrl.snapshot().narration, NarrationState::Paused);
    }

    #[test]
    fn illustration_mode_forces_single_column() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 1, 3);
        let fx = ctrl.handle_command(
            SessionCommand::SetColumnMode {
                mode: ColumnMode::TwoColumn,
            },
            Instant::now(),
        );
        assert!(events(&fx).iter().any(|event| matches!(
            event,
            SessionEvent::LayoutChanged {
                column_mode: ColumnMode::TwoColumn,
                ..
            }
        )));

        let fx = ctrl.handle_command(SessionCommand::SetIllustrationMode { enabled: true }, Instant::now());
        assert!(events(&fx).iter().any(|event| matches!(
            event,
            SessionEvent::LayoutChanged {
                column_mode: ColumnMode::Single,
                ..
            }
        )));
        assert_eq!(ctrl.snapshot().column_mode, ColumnMode::Single);

        let fx = ctrl.handle_command(SessionCommand::SetIllustrationMode { enabled: false }, Instant::now());
        assert!(events(&fx).iter().any(|event| matches!(
            event,
            SessionEvent::LayoutChanged {
                column_mode: ColumnMode::TwoColumn,
                ..
            }
        )));
    }

    #[test]
    fn speed_reading_and_narration_are_exclusive() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 1, 2);
        ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        let fx = ctrl.handle_command(SessionCommand::SpeedReadingStart, Instant::now());
        let emitted = events(&fx);
        assert!(emitted.contains(&&SessionEvent::PlaybackStateChanged {
            state: NarrationState::Stopped
        }));
        assert!(emitted.iter().any(|event| matches!(
            event,
            SessionEvent::SpeedReadingWord { index: 0, word, .. } if word == "Paragraph"
        )));

        let fx = ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        assert!(events(&fx).contains(&&SessionEvent::SpeedReadingStateChanged {
            state: PacerState::Idle
        }));
    }

    #[test]
    fn teardown_frees_audio_and_ignores_late_results() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 1, 3);
        let fx = ctrl.handle_command(SessionCommand::NarrationPlay, Instant::now());
        let (request_id, key, _) = narration_fetches(&fx)[0].clone();
        let fx = ctrl.handle_completion(
            Completion::NarrationFetched {
                request_id,
                result: Ok(AudioClip::new(1, key, vec![1, 2, 3])),
            },
            Instant::now(),
        );
        let (prefetch_id, prefetch_key, prefetch_token) = narration_fetches(&fx)[0].clone();

        let fx = ctrl.teardown();
        assert!(fx
            .iter()
            .any(|effect| matches!(effect, Effect::Audio(AudioCommand::Release(clip)) if clip.id() == 1)));
        assert!(matches!(fx.last(), Some(Effect::CancelAllTimers)));
        assert!(prefetch_token.is_cancelled());
        assert!(ctrl.is_closed());

        let fx = ctrl.handle_completion(
            Completion::NarrationFetched {
                request_id: prefetch_id,
                result: Ok(AudioClip::new(2, prefetch_key, vec![4])),
            },
            Instant::now(),
        );
        assert!(matches!(
            fx.as_slice(),
            [Effect::Audio(AudioCommand::Release(clip))] if clip.id() == 2
        ));
        assert!(ctrl.handle_command(SessionCommand::NextParagraph, Instant::now()).is_empty());
        assert!(ctrl.teardown().is_empty());
    }

    #[test]
    fn chat_submit_sends_request_and_reports_transcript() {
        let mut ctrl = opened(Arc::new(MemoryStore::new()), 1, 1);
        let target = ChatTarget::new(ChatKind::Character, "ahab");
        let fx = ctrl.handle_command(
            SessionCommand::ChatSubmit {
                target: target.clone(),
                message: "Why the whale?".into(),
            },
            Instant::now(),
        );
        let request_id = fx
            .iter()
            .find_map(|effect| match effect {
                Effect::SendChat(request) => Some(request.request_id),
                _ => None,
            })
            .unwrap();
        let fx = ctrl.handle_completion(
            Completion::ChatReply {
                request_id,
                result: Ok("It took my leg.".into()),
            },
            Instant::now(),
        );
        let SessionEvent::ChatUpdated { chat } = events(&fx)[0] else {
            panic!("expected chat update");
        };
        assert_eq!(chat.turns.len(), 2);
    }

    #[test]
    fn book_load_failure_is_reported() {
        let mut ctrl = controller(Arc::new(MemoryStore::new()));
        ctrl.open();
        let fx = ctrl.handle_completion(
            Completion::BookLoaded(Err(ServiceError::Status {
                status: 404,
                message: "no such book".into(),
            })),
            Instant::now(),
        );
        assert!(matches!(events(&fx)[..], [SessionEvent::Notice { .. }]));
        assert!(chapter_request(&fx).is_none());
    }
}
