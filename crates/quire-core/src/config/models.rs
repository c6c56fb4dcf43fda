use crate::characters::TrackerConfig;
use crate::enrichment::PollerConfig;
use crate::model::VoiceParams;
use crate::narration::NarrationConfig;
use crate::pagination::{self, ColumnMode, TextMetrics, ViewportMetrics};
use crate::speed_reading::PacerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Flattened session configuration. The on-disk format is the sectioned
/// layout in `tables.rs`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub service_url: String,
    pub request_timeout_secs: u64,
    pub cache_dir: String,
    pub log_level: LogLevel,
    pub narration_voice: String,
    pub narration_speed: f32,
    pub narration_prefetch: bool,
    pub fallback_speech: bool,
    pub narration_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub status_dedupe_ms: u64,
    pub auto_request_generation: bool,
    pub character_debounce_ms: u64,
    pub toast_duration_ms: u64,
    pub character_poll_interval_ms: u64,
    pub column_mode: ColumnMode,
    pub font_size: u32,
    pub line_spacing: f32,
    pub paragraph_spacing: f32,
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub column_gap: f32,
    pub speed_reading_wpm: u32,
    pub speed_reading_dot_pause_ms: u32,
    pub speed_reading_comma_pause_ms: u32,
    pub chat_history_turns: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            service_url: crate::config::defaults::default_service_url(),
            request_timeout_secs: crate::config::defaults::default_request_timeout_secs(),
            cache_dir: crate::config::defaults::default_cache_dir(),
            log_level: crate::config::defaults::default_log_level(),
            narration_voice: crate::config::defaults::default_narration_voice(),
            narration_speed: crate::config::defaults::default_narration_speed(),
            narration_prefetch: crate::config::defaults::default_narration_prefetch(),
            fallback_speech: crate::config::defaults::default_fallback_speech(),
            narration_grace_ms: crate::config::defaults::default_narration_grace_ms(),
            poll_interval_ms: crate::config::defaults::default_poll_interval_ms(),
            poll_max_attempts: crate::config::defaults::default_poll_max_attempts(),
            status_dedupe_ms: crate::config::defaults::default_status_dedupe_ms(),
            auto_request_generation: crate::config::defaults::default_auto_request_generation(),
            character_debounce_ms: crate::config::defaults::default_character_debounce_ms(),
            toast_duration_ms: crate::config::defaults::default_toast_duration_ms(),
            character_poll_interval_ms:
                crate::config::defaults::default_character_poll_interval_ms(),
            column_mode: crate::config::defaults::default_column_mode(),
            font_size: crate::config::defaults::default_font_size(),
            line_spacing: crate::config::defaults::default_line_spacing(),
            paragraph_spacing: crate::config::defaults::default_paragraph_spacing(),
            viewport_width: crate::config::defaults::default_viewport_width(),
            viewport_height: crate::config::defaults::default_viewport_height(),
            column_gap: crate::config::defaults::default_column_gap(),
            speed_reading_wpm: crate::config::defaults::default_speed_reading_wpm(),
            speed_reading_dot_pause_ms: crate::config::defaults::default_dot_pause_ms(),
            speed_reading_comma_pause_ms: crate::config::defaults::default_comma_pause_ms(),
            chat_history_turns: crate::config::defaults::default_chat_history_turns(),
        }
    }
}

impl AppConfig {
    /// Keep runtime values in bounds regardless of config source.
    pub fn normalized(mut self) -> Self {
        self.font_size = self
            .font_size
            .clamp(pagination::MIN_FONT_SIZE, pagination::MAX_FONT_SIZE);
        self.line_spacing = self.line_spacing.clamp(1.0, 3.0);
        self.paragraph_spacing = self.paragraph_spacing.clamp(0.0, 96.0);
        self.narration_speed = self.narration_speed.clamp(0.5, 3.0);
        self.poll_interval_ms = self.poll_interval_ms.max(100);
        self.poll_max_attempts = self.poll_max_attempts.max(1);
        self.toast_duration_ms = self.toast_duration_ms.max(500);
        self.character_poll_interval_ms = self.character_poll_interval_ms.max(250);
        self.speed_reading_wpm = self.speed_reading_wpm.clamp(
            crate::speed_reading::MIN_WPM,
            crate::speed_reading::MAX_WPM,
        );
        self.chat_history_turns = self.chat_history_turns.clamp(1, 50);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn voice(&self) -> VoiceParams {
        VoiceParams {
            voice: self.narration_voice.clone(),
            speed: self.narration_speed,
        }
    }

    pub fn narration(&self) -> NarrationConfig {
        NarrationConfig {
            prefetch: self.narration_prefetch,
            fallback_available: self.fallback_speech,
            grace: Duration::from_millis(self.narration_grace_ms),
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.poll_max_attempts,
            dedupe_window: Duration::from_millis(self.status_dedupe_ms),
            auto_request: self.auto_request_generation,
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            debounce: Duration::from_millis(self.character_debounce_ms),
            toast_duration: Duration::from_millis(self.toast_duration_ms),
            poll_interval: Duration::from_millis(self.character_poll_interval_ms),
        }
    }

    pub fn pacer(&self) -> PacerConfig {
        PacerConfig {
            wpm: self.speed_reading_wpm,
            dot_pause_ms: self.speed_reading_dot_pause_ms,
            comma_pause_ms: self.speed_reading_comma_pause_ms,
        }
    }

    pub fn text_metrics(&self) -> TextMetrics {
        TextMetrics {
            font_size: self.font_size as f32,
            line_spacing: self.line_spacing,
            paragraph_spacing: self.paragraph_spacing,
        }
    }

    pub fn viewport(&self) -> ViewportMetrics {
        ViewportMetrics {
            width: self.viewport_width,
            height: self.viewport_height,
            column_gap: self.column_gap,
        }
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
