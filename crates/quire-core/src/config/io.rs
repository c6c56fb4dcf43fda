use super::models::AppConfig;
use super::tables::ConfigTables;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Load configuration from the given path, falling back to defaults on error.
pub fn load_config(path: &Path) -> AppConfig {
    let contents = match fs::read_to_string(path) {
        Ok(data) => {
            info!(path = %path.display(), "Loaded base config");
            data
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                "Falling back to default config: {err}"
            );
            return AppConfig::default();
        }
    };

    match parse_config(&contents) {
        Ok(cfg) => {
            debug!("Parsed configuration from disk");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid config TOML: {err}");
            AppConfig::default()
        }
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig, toml::de::Error> {
    let tables: ConfigTables = toml::from_str(contents)?;
    Ok(AppConfig::from(tables).normalized())
}

pub fn serialize_config(config: &AppConfig) -> Result<String, toml::ser::Error> {
    toml::to_string(&ConfigTables::from(config))
}

#[cfg(test)]
mod tests {
    use super::{parse_config, serialize_config};
    use crate::config::{AppConfig, LogLevel};
    use crate::pagination::ColumnMode;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.poll_interval_ms, 2_000);
        assert_eq!(config.poll_max_attempts, 90);
        assert_eq!(config.character_debounce_ms, 300);
        assert_eq!(config.toast_duration_ms, 8_000);
        assert_eq!(config.character_poll_interval_ms, 3_000);
    }

    #[test]
    fn partial_tables_keep_defaults_for_missing_keys() {
        let config = parse_config(
            r#"
            [logging]
            log_level = "debug"

            [layout]
            column_mode = "two-column"
            font_size = 80
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.column_mode, ColumnMode::TwoColumn);
        assert_eq!(config.font_size, crate::pagination::MAX_FONT_SIZE);
        assert_eq!(config.narration_grace_ms, 1_500);
    }

    #[test]
    fn invalid_values_are_reported() {
        assert!(parse_config("[layout]\ncolumn_mode = \"three\"").is_err());
    }

    #[test]
    fn serialized_config_parses_back() {
        let mut config = AppConfig::default();
        config.narration_voice = "alto".to_string();
        config.speed_reading_wpm = 450;
        let text = serialize_config(&config).unwrap();
        assert!(text.contains("[narration]"));
        assert_eq!(parse_config(&text).unwrap(), config);
    }
}
