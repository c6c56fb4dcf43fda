use crate::pagination::ColumnMode;

pub(crate) fn default_service_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

pub(crate) fn default_request_timeout_secs() -> u64 {
    20
}

pub(crate) fn default_cache_dir() -> String {
    ".cache".to_string()
}

pub(crate) fn default_log_level() -> crate::config::LogLevel {
    crate::config::LogLevel::Info
}

pub(crate) fn default_narration_voice() -> String {
    "narrator".to_string()
}

pub(crate) fn default_narration_speed() -> f32 {
    1.0
}

pub(crate) fn default_narration_prefetch() -> bool {
    true
}

pub(crate) fn default_fallback_speech() -> bool {
    true
}

pub(crate) fn default_narration_grace_ms() -> u64 {
    1_500
}

pub(crate) fn default_poll_interval_ms() -> u64 {
    2_000
}

pub(crate) fn default_poll_max_attempts() -> u32 {
    90
}

pub(crate) fn default_status_dedupe_ms() -> u64 {
    1_500
}

pub(crate) fn default_auto_request_generation() -> bool {
    true
}

pub(crate) fn default_character_debounce_ms() -> u64 {
    300
}

pub(crate) fn default_toast_duration_ms() -> u64 {
    8_000
}

pub(crate) fn default_character_poll_interval_ms() -> u64 {
    3_000
}

pub(crate) fn default_column_mode() -> ColumnMode {
    ColumnMode::Single
}

pub(crate) fn default_font_size() -> u32 {
    18
}

pub(crate) fn default_line_spacing() -> f32 {
    1.4
}

pub(crate) fn default_paragraph_spacing() -> f32 {
    12.0
}

pub(crate) fn default_viewport_width() -> f32 {
    900.0
}

pub(crate) fn default_viewport_height() -> f32 {
    700.0
}

pub(crate) fn default_column_gap() -> f32 {
    48.0
}

pub(crate) fn default_speed_reading_wpm() -> u32 {
    300
}

pub(crate) fn default_dot_pause_ms() -> u32 {
    240
}

pub(crate) fn default_comma_pause_ms() -> u32 {
    120
}

pub(crate) fn default_chat_history_turns() -> usize {
    10
}
