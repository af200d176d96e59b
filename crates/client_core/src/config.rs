use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "console.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSettings {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub credentials_path: PathBuf,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api".into(),
            request_timeout_secs: 30,
            credentials_path: PathBuf::from("./data/credentials.json"),
        }
    }
}

impl ConsoleSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

pub fn load_settings() -> ConsoleSettings {
    load_settings_with(Path::new(DEFAULT_SETTINGS_FILE), |key| {
        std::env::var(key).ok()
    })
}

/// Defaults, then the settings file, then environment overrides.
pub fn load_settings_with(
    settings_file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ConsoleSettings {
    let mut settings = ConsoleSettings::default();

    if let Ok(raw) = fs::read_to_string(settings_file) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url").and_then(toml::Value::as_str) {
                settings.api_base_url = v.to_string();
            }
            if let Some(v) = file_cfg
                .get("request_timeout_secs")
                .and_then(toml::Value::as_integer)
            {
                if let Ok(parsed) = u64::try_from(v) {
                    settings.request_timeout_secs = parsed;
                }
            }
            if let Some(v) = file_cfg.get("credentials_path").and_then(toml::Value::as_str) {
                settings.credentials_path = PathBuf::from(v);
            }
        }
    }

    if let Some(v) = env("CONSOLE_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    if let Some(v) = env("APP__CREDENTIALS_PATH") {
        settings.credentials_path = PathBuf::from(v);
    }

    settings
}

/// Normalizes the configured base URL into one that resource paths can be
/// joined onto.
pub fn prepare_api_base_url(raw_base_url: &str) -> anyhow::Result<Url> {
    let normalized = normalize_api_base_url(raw_base_url);
    let url = Url::parse(&normalized)
        .with_context(|| format!("invalid api base url '{raw_base_url}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!(
            "api base url must start with http:// or https://, got '{raw_base_url}'"
        ));
    }
    Ok(url)
}

fn normalize_api_base_url(raw_base_url: &str) -> String {
    let trimmed = raw_base_url.trim();
    if trimmed.is_empty() {
        return normalize_api_base_url(&ConsoleSettings::default().api_base_url);
    }
    format!("{}/", trimmed.trim_end_matches('/'))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
