//! Audio narration of the paragraph under the cursor.
//!
//! The pipeline is a pure state machine: hosts feed it [`NarrationEvent`]s and
//! execute the returned [`NarrationAction`]s. It keeps at most one active
//! audio clip (or fetch) and one prefetched clip for the following paragraph.

mod transitions;

pub use transitions::{NarrationAction, NarrationEvent, transition};

use crate::cancellation::CancellationToken;
use crate::model::VoiceParams;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq)]
pub struct NarrationConfig {
    pub prefetch: bool,
    pub fallback_available: bool,
    pub grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum NarrationState {
    #[default]
    Stopped,
    Speaking,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum NarrationMode {
    #[default]
    Primary,
    Fallback,
}

/// Identity of one narrated paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ClipKey {
    pub chapter_id: String,
    pub paragraph_index: usize,
}

impl ClipKey {
    pub fn new(chapter_id: impl Into<String>, paragraph_index: usize) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            paragraph_index,
        }
    }
}

impl std::fmt::Display for ClipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.chapter_id, self.paragraph_index)
    }
}

/// Produced narration audio. Deliberately not `Clone`: releasing a clip
/// consumes it, so it can only be released once.
#[derive(Debug)]
pub struct AudioClip {
    id: u64,
    key: ClipKey,
    data: Arc<[u8]>,
}

impl AudioClip {
    pub fn new(id: u64, key: ClipKey, data: Vec<u8>) -> Self {
        Self {
            id,
            key,
            data: data.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ClipKey {
        &self.key
    }

    pub fn data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }
}

/// The paragraph to narrate plus the one after it, if it is in the same
/// chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrationTarget {
    pub key: ClipKey,
    pub text: String,
    pub next: Option<ClipKey>,
}

#[derive(Debug)]
pub(crate) enum ActiveSlot {
    /// Speaking but waiting for a paragraph (chapter still loading).
    Idle,
    Fetching {
        request_id: u64,
        key: ClipKey,
        token: CancellationToken,
    },
    Clip {
        clip: AudioClip,
        started: bool,
    },
    Fallback {
        key: ClipKey,
        utterance_id: u64,
        started: bool,
    },
    Grace {
        key: ClipKey,
        seq: u64,
        armed: bool,
    },
}

#[derive(Debug)]
pub(crate) enum PrefetchSlot {
    Empty,
    Pending {
        request_id: u64,
        key: ClipKey,
        token: CancellationToken,
    },
    Ready(AudioClip),
}

pub struct NarrationPipeline {
    pub(crate) config: NarrationConfig,
    pub(crate) voice: VoiceParams,
    pub(crate) primary_available: bool,
    pub(crate) state: NarrationState,
    pub(crate) mode: NarrationMode,
    pub(crate) target: Option<NarrationTarget>,
    pub(crate) active: ActiveSlot,
    pub(crate) prefetch: PrefetchSlot,
    pub(crate) request_id: u64,
    pub(crate) utterance_id: u64,
    pub(crate) grace_seq: u64,
}

impl NarrationPipeline {
    pub fn new(config: NarrationConfig, voice: VoiceParams) -> Self {
        Self {
            config,
            voice,
            primary_available: true,
            state: NarrationState::Stopped,
            mode: NarrationMode::Primary,
            target: None,
            active: ActiveSlot::Idle,
            prefetch: PrefetchSlot::Empty,
            request_id: 0,
            utterance_id: 0,
            grace_seq: 0,
        }
    }

    pub fn handle(&mut self, event: NarrationEvent) -> Vec<NarrationAction> {
        transition(self, event)
    }

    pub fn state(&self) -> NarrationState {
        self.state
    }

    pub fn mode(&self) -> NarrationMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.state != NarrationState::Stopped
    }

    /// Paragraph currently owned by the active slot, if any.
    pub fn active_key(&self) -> Option<&ClipKey> {
        match &self.active {
            ActiveSlot::Idle => None,
            ActiveSlot::Fetching { key, .. }
            | ActiveSlot::Fallback { key, .. }
            | ActiveSlot::Grace { key, .. } => Some(key),
            ActiveSlot::Clip { clip, .. } => Some(clip.key()),
        }
    }

    pub fn prefetched_key(&self) -> Option<&ClipKey> {
        match &self.prefetch {
            PrefetchSlot::Empty => None,
            PrefetchSlot::Pending { key, .. } => Some(key),
            PrefetchSlot::Ready(clip) => Some(clip.key()),
        }
    }

    pub fn can_narrate(&self) -> bool {
        self.primary_available || self.config.fallback_available
    }
}
