//! Rapid serial word presentation over the paragraph under the cursor.

use crate::narration::ClipKey;
use crate::text_utils::{ends_clause, ends_sentence, split_words};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use ts_rs::TS;

pub const MIN_WPM: u32 = 100;
pub const MAX_WPM: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct PacerConfig {
    pub wpm: u32,
    pub dot_pause_ms: u32,
    pub comma_pause_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PacerState {
    #[default]
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacerAction {
    ShowWord {
        key: ClipKey,
        index: usize,
        word: String,
    },
    ScheduleNext {
        seq: u64,
        delay: Duration,
    },
    Advance {
        from: ClipKey,
    },
    StateChanged(PacerState),
}

pub struct SpeedReadingPacer {
    config: PacerConfig,
    state: PacerState,
    paragraph: Option<ClipKey>,
    words: Vec<String>,
    position: usize,
    seq: u64,
}

impl SpeedReadingPacer {
    pub fn new(mut config: PacerConfig) -> Self {
        config.wpm = config.wpm.clamp(MIN_WPM, MAX_WPM);
        Self {
            config,
            state: PacerState::Idle,
            paragraph: None,
            words: Vec::new(),
            position: 0,
            seq: 0,
        }
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != PacerState::Idle
    }

    pub fn wpm(&self) -> u32 {
        self.config.wpm
    }

    pub fn set_wpm(&mut self, wpm: u32) {
        self.config.wpm = wpm.clamp(MIN_WPM, MAX_WPM);
        debug!(wpm = self.config.wpm, "Speed reading pace updated");
    }

    /// Milliseconds to hold `word` on screen.
    pub fn word_delay(&self, word: &str) -> Duration {
        let base = 60_000 / self.config.wpm.max(1);
        let punctuation = if ends_sentence(word) {
            self.config.dot_pause_ms
        } else if ends_clause(word) {
            self.config.comma_pause_ms
        } else {
            0
        };
        Duration::from_millis(u64::from(base + punctuation))
    }

    pub fn start(&mut self, paragraph: Option<(ClipKey, &str)>) -> Vec<PacerAction> {
        match self.state {
            PacerState::Idle => {}
            PacerState::Paused => {
                let mut actions = self.retarget(paragraph);
                actions.extend(self.resume());
                return actions;
            }
            PacerState::Running => return self.retarget(paragraph),
        }
        self.state = PacerState::Running;
        let mut actions = vec![PacerAction::StateChanged(PacerState::Running)];
        actions.extend(self.load(paragraph));
        actions
    }

    pub fn retarget(&mut self, paragraph: Option<(ClipKey, &str)>) -> Vec<PacerAction> {
        if self.state == PacerState::Idle {
            return Vec::new();
        }
        if let (Some((key, _)), Some(current)) = (&paragraph, &self.paragraph) {
            if key == current && !self.words.is_empty() {
                return Vec::new();
            }
        }
        self.load(paragraph)
    }

    pub fn pause(&mut self) -> Vec<PacerAction> {
        if self.state != PacerState::Running {
            return Vec::new();
        }
        self.state = PacerState::Paused;
        self.seq = self.seq.wrapping_add(1);
        vec![PacerAction::StateChanged(PacerState::Paused)]
    }

    pub fn resume(&mut self) -> Vec<PacerAction> {
        if self.state != PacerState::Paused {
            return Vec::new();
        }
        self.state = PacerState::Running;
        let mut actions = vec![PacerAction::StateChanged(PacerState::Running)];
        actions.extend(self.present());
        actions
    }

    pub fn stop(&mut self) -> Vec<PacerAction> {
        if self.state == PacerState::Idle {
            return Vec::new();
        }
        self.state = PacerState::Idle;
        self.seq = self.seq.wrapping_add(1);
        self.words.clear();
        self.paragraph = None;
        self.position = 0;
        vec![PacerAction::StateChanged(PacerState::Idle)]
    }

    pub fn on_tick(&mut self, seq: u64) -> Vec<PacerAction> {
        if seq != self.seq || self.state != PacerState::Running {
            return Vec::new();
        }
        self.position += 1;
        self.present()
    }

    fn load(&mut self, paragraph: Option<(ClipKey, &str)>) -> Vec<PacerAction> {
        self.seq = self.seq.wrapping_add(1);
        self.position = 0;
        match paragraph {
            Some((key, text)) => {
                self.words = split_words(text);
                self.paragraph = Some(key);
            }
            None => {
                self.words.clear();
                self.paragraph = None;
                return Vec::new();
            }
        }
        if self.state == PacerState::Running {
            self.present()
        } else {
            Vec::new()
        }
    }

    /// Show the word at the current position, or hand off to the next
    /// paragraph once this one is exhausted.
    fn present(&mut self) -> Vec<PacerAction> {
        let Some(key) = self.paragraph.clone() else {
            return Vec::new();
        };
        let Some(word) = self.words.get(self.position).cloned() else {
            debug!(key = %key, "Paragraph finished; advancing");
            self.words.clear();
            self.paragraph = None;
            return vec![PacerAction::Advance { from: key }];
        };
        self.seq = self.seq.wrapping_add(1);
        let delay = self.word_delay(&word);
        vec![
            PacerAction::ShowWord {
                key,
                index: self.position,
                word,
            },
            PacerAction::ScheduleNext {
                seq: self.seq,
                delay,
            },
        ]
    }
}
