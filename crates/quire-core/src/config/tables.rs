use super::defaults;
use super::models::{AppConfig, LogLevel};
use crate::pagination::ColumnMode;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub(super) struct ConfigTables {
    #[serde(default)]
    service: ServiceConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    narration: NarrationTable,
    #[serde(default)]
    enrichment: EnrichmentTable,
    #[serde(default)]
    characters: CharactersTable,
    #[serde(default)]
    layout: LayoutTable,
    #[serde(default)]
    speed_reading: SpeedReadingTable,
    #[serde(default)]
    chat: ChatTable,
}

impl From<ConfigTables> for AppConfig {
    fn from(tables: ConfigTables) -> Self {
        AppConfig {
            service_url: tables.service.url,
            request_timeout_secs: tables.service.request_timeout_secs,
            cache_dir: tables.storage.cache_dir,
            log_level: tables.logging.log_level,
            narration_voice: tables.narration.voice,
            narration_speed: tables.narration.speed,
            narration_prefetch: tables.narration.prefetch,
            fallback_speech: tables.narration.fallback_speech,
            narration_grace_ms: tables.narration.grace_ms,
            poll_interval_ms: tables.enrichment.poll_interval_ms,
            poll_max_attempts: tables.enrichment.poll_max_attempts,
            status_dedupe_ms: tables.enrichment.status_dedupe_ms,
            auto_request_generation: tables.enrichment.auto_request_generation,
            character_debounce_ms: tables.characters.debounce_ms,
            toast_duration_ms: tables.characters.toast_duration_ms,
            character_poll_interval_ms: tables.characters.poll_interval_ms,
            column_mode: tables.layout.column_mode,
            font_size: tables.layout.font_size,
            line_spacing: tables.layout.line_spacing,
            paragraph_spacing: tables.layout.paragraph_spacing,
            viewport_width: tables.layout.viewport_width,
            viewport_height: tables.layout.viewport_height,
            column_gap: tables.layout.column_gap,
            speed_reading_wpm: tables.speed_reading.wpm,
            speed_reading_dot_pause_ms: tables.speed_reading.dot_pause_ms,
            speed_reading_comma_pause_ms: tables.speed_reading.comma_pause_ms,
            chat_history_turns: tables.chat.history_turns,
        }
    }
}

impl From<&AppConfig> for ConfigTables {
    fn from(config: &AppConfig) -> Self {
        ConfigTables {
            service: ServiceConfig {
                url: config.service_url.clone(),
                request_timeout_secs: config.request_timeout_secs,
            },
            storage: StorageConfig {
                cache_dir: config.cache_dir.clone(),
            },
            logging: LoggingConfig {
                log_level: config.log_level,
            },
            narration: NarrationTable {
                voice: config.narration_voice.clone(),
                speed: config.narration_speed,
                prefetch: config.narration_prefetch,
                fallback_speech: config.fallback_speech,
                grace_ms: config.narration_grace_ms,
            },
            enrichment: EnrichmentTable {
                poll_interval_ms: config.poll_interval_ms,
                poll_max_attempts: config.poll_max_attempts,
                status_dedupe_ms: config.status_dedupe_ms,
                auto_request_generation: config.auto_request_generation,
            },
            characters: CharactersTable {
                debounce_ms: config.character_debounce_ms,
                toast_duration_ms: config.toast_duration_ms,
                poll_interval_ms: config.character_poll_interval_ms,
            },
            layout: LayoutTable {
                column_mode: config.column_mode,
                font_size: config.font_size,
                line_spacing: config.line_spacing,
                paragraph_spacing: config.paragraph_spacing,
                viewport_width: config.viewport_width,
                viewport_height: config.viewport_height,
                column_gap: config.column_gap,
            },
            speed_reading: SpeedReadingTable {
                wpm: config.speed_reading_wpm,
                dot_pause_ms: config.speed_reading_dot_pause_ms,
                comma_pause_ms: config.speed_reading_comma_pause_ms,
            },
            chat: ChatTable {
                history_turns: config.chat_history_turns,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct ServiceConfig {
    #[serde(default = "defaults::default_service_url")]
    url: String,
    #[serde(default = "defaults::default_request_timeout_secs")]
    request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            url: defaults::default_service_url(),
            request_timeout_secs: defaults::default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct StorageConfig {
    #[serde(default = "defaults::default_cache_dir")]
    cache_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            cache_dir: defaults::default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    log_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: defaults::default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct NarrationTable {
    #[serde(default = "defaults::default_narration_voice")]
    voice: String,
    #[serde(default = "defaults::default_narration_speed")]
    speed: f32,
    #[serde(default = "defaults::default_narration_prefetch")]
    prefetch: bool,
    #[serde(default = "defaults::default_fallback_speech")]
    fallback_speech: bool,
    #[serde(default = "defaults::default_narration_grace_ms")]
    grace_ms: u64,
}

impl Default for NarrationTable {
    fn default() -> Self {
        NarrationTable {
            voice: defaults::default_narration_voice(),
            speed: defaults::default_narration_speed(),
            prefetch: defaults::default_narration_prefetch(),
            fallback_speech: defaults::default_fallback_speech(),
            grace_ms: defaults::default_narration_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct EnrichmentTable {
    #[serde(default = "defaults::default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "defaults::default_poll_max_attempts")]
    poll_max_attempts: u32,
    #[serde(default = "defaults::default_status_dedupe_ms")]
    status_dedupe_ms: u64,
    #[serde(default = "defaults::default_auto_request_generation")]
    auto_request_generation: bool,
}

impl Default for EnrichmentTable {
    fn default() -> Self {
        EnrichmentTable {
            poll_interval_ms: defaults::default_poll_interval_ms(),
            poll_max_attempts: defaults::default_poll_max_attempts(),
            status_dedupe_ms: defaults::default_status_dedupe_ms(),
            auto_request_generation: defaults::default_auto_request_generation(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct CharactersTable {
    #[serde(default = "defaults::default_character_debounce_ms")]
    debounce_ms: u64,
    #[serde(default = "defaults::default_toast_duration_ms")]
    toast_duration_ms: u64,
    #[serde(default = "defaults::default_character_poll_interval_ms")]
    poll_interval_ms: u64,
}

impl Default for CharactersTable {
    fn default() -> Self {
        CharactersTable {
            debounce_ms: defaults::default_character_debounce_ms(),
            toast_duration_ms: defaults::default_toast_duration_ms(),
            poll_interval_ms: defaults::default_character_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct LayoutTable {
    #[serde(default = "defaults::default_column_mode")]
    column_mode: ColumnMode,
    #[serde(default = "defaults::default_font_size")]
    font_size: u32,
    #[serde(default = "defaults::default_line_spacing")]
    line_spacing: f32,
    #[serde(default = "defaults::default_paragraph_spacing")]
    paragraph_spacing: f32,
    #[serde(default = "defaults::default_viewport_width")]
    viewport_width: f32,
    #[serde(default = "defaults::default_viewport_height")]
    viewport_height: f32,
    #[serde(default = "defaults::default_column_gap")]
    column_gap: f32,
}

impl Default for LayoutTable {
    fn default() -> Self {
        LayoutTable {
            column_mode: defaults::default_column_mode(),
            font_size: defaults::default_font_size(),
            line_spacing: defaults::default_line_spacing(),
            paragraph_spacing: defaults::default_paragraph_spacing(),
            viewport_width: defaults::default_viewport_width(),
            viewport_height: defaults::default_viewport_height(),
            column_gap: defaults::default_column_gap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct SpeedReadingTable {
    #[serde(default = "defaults::default_speed_reading_wpm")]
    wpm: u32,
    #[serde(default = "defaults::default_dot_pause_ms")]
    dot_pause_ms: u32,
    #[serde(default = "defaults::default_comma_pause_ms")]
    comma_pause_ms: u32,
}

impl Default for SpeedReadingTable {
    fn default() -> Self {
        SpeedReadingTable {
            wpm: defaults::default_speed_reading_wpm(),
            dot_pause_ms: defaults::default_dot_pause_ms(),
            comma_pause_ms: defaults::default_comma_pause_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct ChatTable {
    #[serde(default = "defaults::default_chat_history_turns")]
    history_turns: usize,
}

impl Default for ChatTable {
    fn default() -> Self {
        ChatTable {
            history_turns: defaults::default_chat_history_turns(),
        }
    }
}
