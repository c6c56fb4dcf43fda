//! Book, chapter, character and generation-job records shared across the
//! engine and exchanged with the remote service.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Chapter {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(default)]
#[ts(export)]
pub struct FeatureFlags {
    pub narration: bool,
    pub illustration: bool,
    pub character: bool,
    pub recap: bool,
    pub quiz: bool,
}

impl FeatureFlags {
    pub fn allows(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Recap => self.recap,
            JobKind::Quiz => self.quiz,
            JobKind::Illustration => self.illustration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub features: FeatureFlags,
}

impl Book {
    pub fn chapter_id(&self, index: usize) -> Option<&str> {
        self.chapters.get(index).map(|chapter| chapter.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paragraph {
    pub content: String,
}

impl Paragraph {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CharacterRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub first_chapter_index: usize,
    pub first_paragraph_index: usize,
    #[serde(default)]
    pub portrait_ready: bool,
}

impl CharacterRecord {
    /// A character is visible once the reader has reached its first
    /// appearance.
    pub fn is_visible_at(&self, chapter_index: usize, paragraph_index: usize) -> bool {
        self.first_chapter_index < chapter_index
            || (self.first_chapter_index == chapter_index
                && self.first_paragraph_index <= paragraph_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum JobKind {
    Recap,
    Quiz,
    Illustration,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Recap, JobKind::Quiz, JobKind::Illustration];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Recap => "recap",
            JobKind::Quiz => "quiz",
            JobKind::Illustration => "illustration",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum JobStatus {
    Missing,
    Pending,
    Generating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Generating)
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Generation jobs are server-owned; the client only ever sees snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl JobSnapshot {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            payload: None,
        }
    }

    pub fn completed(payload: serde_json::Value) -> Self {
        Self {
            status: JobStatus::Completed,
            payload: Some(payload),
        }
    }
}

/// Generation jobs are identified by their kind and chapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JobKey {
    pub kind: JobKind,
    pub chapter_id: String,
}

impl JobKey {
    pub fn new(kind: JobKind, chapter_id: impl Into<String>) -> Self {
        Self {
            kind,
            chapter_id: chapter_id.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.chapter_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
}
