//! Reading session: host commands in, effects and events out.
//!
//! [`SessionController`] owns every piece of session state and never awaits.
//! Work it cannot do synchronously (network calls, timers, audio) comes back
//! as [`Effect`]s; the results return as [`Completion`]s.

mod controller;

pub use controller::SessionController;

use crate::cancellation::CancellationToken;
use crate::characters::ToastSnapshot;
use crate::chat::{ChatRequest, ChatSnapshot, ChatTarget};
use crate::enrichment::JobFailure;
use crate::error::ServiceError;
use crate::model::{Book, CharacterRecord, FeatureFlags, JobKey, JobKind, JobSnapshot, JobStatus, Paragraph, VoiceParams};
use crate::narration::{AudioClip, ClipKey, NarrationMode, NarrationState};
use crate::navigation::{Cursor, Seek};
use crate::pagination::ColumnMode;
use crate::speed_reading::PacerState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use ts_rs::TS;

/// Modal views layered over the reader. While one is open, playback pauses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export)]
pub enum Overlay {
    Recap,
    Quiz,
    Characters,
    Chat { target: ChatTarget },
}

impl Overlay {
    pub(crate) fn job_kind(&self) -> Option<JobKind> {
        match self {
            Overlay::Recap => Some(JobKind::Recap),
            Overlay::Quiz => Some(JobKind::Quiz),
            Overlay::Characters | Overlay::Chat { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    GetSnapshot,
    NextPage,
    PrevPage,
    NextParagraph,
    PrevParagraph,
    NextChapter,
    PrevChapter,
    GotoChapter {
        chapter: usize,
        page: usize,
        paragraph: usize,
    },
    SeekParagraph {
        paragraph: usize,
    },
    SetColumnMode {
        mode: ColumnMode,
    },
    SetViewport {
        width: f32,
        height: f32,
    },
    SetParagraphHeights {
        chapter_index: usize,
        heights: Vec<f32>,
    },
    NarrationPlay,
    NarrationPause,
    NarrationResume,
    NarrationStop,
    SetVoice {
        voice: String,
        speed: f32,
    },
    SpeedReadingStart,
    SpeedReadingPause,
    SpeedReadingResume,
    SpeedReadingStop,
    SetWpm {
        wpm: u32,
    },
    OpenOverlay {
        overlay: Overlay,
    },
    CloseOverlay,
    SetIllustrationMode {
        enabled: bool,
    },
    RequestGeneration {
        kind: JobKind,
    },
    RegenerateIllustration {
        parameter: String,
    },
    AcceptIllustration,
    DiscardIllustration,
    DismissToast,
    ChatSubmit {
        target: ChatTarget,
        message: String,
    },
    ChatRetry {
        target: ChatTarget,
    },
}

impl SessionCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::GetSnapshot => "reader_get_snapshot",
            Self::NextPage => "reader_next_page",
            Self::PrevPage => "reader_prev_page",
            Self::NextParagraph => "reader_next_paragraph",
            Self::PrevParagraph => "reader_prev_paragraph",
            Self::NextChapter => "reader_next_chapter",
            Self::PrevChapter => "reader_prev_chapter",
            Self::GotoChapter { .. } => "reader_goto_chapter",
            Self::SeekParagraph { .. } => "reader_seek_paragraph",
            Self::SetColumnMode { .. } => "reader_set_column_mode",
            Self::SetViewport { .. } => "reader_set_viewport",
            Self::SetParagraphHeights { .. } => "reader_set_paragraph_heights",
            Self::NarrationPlay => "reader_narration_play",
            Self::NarrationPause => "reader_narration_pause",
            Self::NarrationResume => "reader_narration_resume",
            Self::NarrationStop => "reader_narration_stop",
            Self::SetVoice { .. } => "reader_set_voice",
            Self::SpeedReadingStart => "reader_speed_reading_start",
            Self::SpeedReadingPause => "reader_speed_reading_pause",
            Self::SpeedReadingResume => "reader_speed_reading_resume",
            Self::SpeedReadingStop => "reader_speed_reading_stop",
            Self::SetWpm { .. } => "reader_set_wpm",
            Self::OpenOverlay { .. } => "reader_open_overlay",
            Self::CloseOverlay => "reader_close_overlay",
            Self::SetIllustrationMode { .. } => "reader_set_illustration_mode",
            Self::RequestGeneration { .. } => "reader_request_generation",
            Self::RegenerateIllustration { .. } => "reader_regenerate_illustration",
            Self::AcceptIllustration => "reader_accept_illustration",
            Self::DiscardIllustration => "reader_discard_illustration",
            Self::DismissToast => "reader_dismiss_toast",
            Self::ChatSubmit { .. } => "reader_chat_submit",
            Self::ChatRetry { .. } => "reader_chat_retry",
        }
    }
}

/// Identity of a scheduled timer. Scheduling a key replaces its old timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    NarrationGrace,
    JobPoll(JobKey),
    CharacterDebounce,
    CharacterPoll,
    ToastDismiss,
    SpeedReadingWord,
}

/// Results of effects, fed back into the controller.
#[derive(Debug)]
pub enum Completion {
    BookLoaded(Result<Book, ServiceError>),
    FeaturesLoaded(Result<FeatureFlags, ServiceError>),
    ChapterLoaded {
        request_id: u64,
        result: Result<Vec<Paragraph>, ServiceError>,
    },
    NarrationFetched {
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
    JobStatus {
        request_id: u64,
        result: Result<JobSnapshot, ServiceError>,
    },
    JobCommand {
        request_id: u64,
        result: Result<JobSnapshot, ServiceError>,
    },
    CharactersUpTo {
        request_id: u64,
        result: Result<Vec<CharacterRecord>, ServiceError>,
    },
    CharactersSince {
        request_id: u64,
        result: Result<Vec<CharacterRecord>, ServiceError>,
        now_unix_ms: u64,
    },
    ChatReply {
        request_id: u64,
        result: Result<String, ServiceError>,
    },
    TimerFired {
        key: TimerKey,
        seq: u64,
    },
}

#[derive(Debug)]
pub enum AudioCommand {
    Play {
        clip_id: u64,
        key: ClipKey,
        data: Arc<[u8]>,
    },
    Pause {
        clip_id: u64,
    },
    Resume {
        clip_id: u64,
    },
    Stop {
        clip_id: u64,
    },
    Release(AudioClip),
    Speak {
        utterance_id: u64,
        text: String,
    },
    CancelSpeech {
        utterance_id: u64,
    },
}

#[derive(Debug)]
pub enum Effect {
    FetchBook,
    FetchFeatures,
    FetchChapter {
        request_id: u64,
        chapter_id: String,
        token: CancellationToken,
    },
    FetchNarration {
        request_id: u64,
        key: ClipKey,
        voice: VoiceParams,
        token: CancellationToken,
    },
    FetchJobStatus {
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
    FetchCharactersUpTo {
        request_id: u64,
        chapter_index: usize,
        paragraph_index: usize,
    },
    FetchCharactersSince {
        request_id: u64,
        since_unix_ms: u64,
    },
    SendChat(ChatRequest),
    Audio(AudioCommand),
    ScheduleTimer {
        key: TimerKey,
        seq: u64,
        delay: Duration,
    },
    CancelTimer {
        key: TimerKey,
    },
    /// Drop every timer; the session is closing.
    CancelAllTimers,
    Emit(SessionEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct SessionSnapshot {
    pub book_id: String,
    pub title: Option<String>,
    pub chapter_id: Option<String>,
    pub cursor: Cursor,
    pub page_count: usize,
    pub paragraph_count: usize,
    pub column_mode: ColumnMode,
    pub illustration_mode: bool,
    pub narration: NarrationState,
    pub narration_mode: NarrationMode,
    pub speed_reading: PacerState,
    pub overlay: Option<Overlay>,
    pub toasts: ToastSnapshot,
    pub discovered_characters: usize,
}

/// State changes reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum SessionEvent {
    BookOpened {
        book_id: String,
        title: String,
        chapter_count: usize,
        features: FeatureFlags,
    },
    CursorChanged {
        chapter_id: String,
        chapter_index: usize,
        page_index: usize,
        paragraph_index: usize,
        page_count: usize,
    },
    LayoutChanged {
        chapter_id: String,
        page_count: usize,
        column_mode: ColumnMode,
    },
    PlaybackStateChanged {
        state: NarrationState,
    },
    PlaybackModeChanged {
        mode: NarrationMode,
        chapter_id: Option<String>,
        paragraph_index: Option<usize>,
    },
    JobStatusChanged {
        job: JobKey,
        status: JobStatus,
    },
    GenerationReady {
        job: JobKey,
        payload: Option<Value>,
    },
    GenerationCandidate {
        job: JobKey,
        payload: Option<Value>,
    },
    GenerationAccepted {
        job: JobKey,
        payload: Option<Value>,
    },
    GenerationFailed {
        job: JobKey,
        reason: JobFailure,
    },
    CharactersDiscovered {
        characters: Vec<CharacterRecord>,
    },
    ToastQueueChanged {
        toasts: ToastSnapshot,
    },
    SpeedReadingStateChanged {
        state: PacerState,
    },
    SpeedReadingWord {
        chapter_id: String,
        paragraph_index: usize,
        index: usize,
        word: String,
    },
    ChatUpdated {
        chat: ChatSnapshot,
    },
    ChapterFinished {
        chapter_index: usize,
        show_overlay_prompt: bool,
    },
    OverlayChanged {
        overlay: Option<Overlay>,
    },
    Snapshot {
        snapshot: SessionSnapshot,
    },
    Notice {
        message: String,
    },
}

/// Pending chapter load; results with another id are stale.
#[derive(Debug)]
pub(crate) struct PendingChapter {
    pub(crate) request_id: u64,
    pub(crate) chapter_index: usize,
    pub(crate) seek: Seek,
    pub(crate) token: CancellationToken,
}
