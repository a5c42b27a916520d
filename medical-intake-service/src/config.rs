use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_OCR_MAX_PDF_PAGES: usize = 8;
const DEFAULT_HEARTBEAT_SECONDS: f64 = 0.8;
const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Service settings, read from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openrouter_api_key: String,
    pub model: String,
    pub temperature: f32,
    pub ocr_model: String,
    pub ocr_max_pdf_pages: usize,
    pub heartbeat: Duration,
    pub port: u16,
    /// Request body cap for document uploads
    pub max_upload_bytes: usize,
    pub database_url: Option<String>,
    pub clinical_policy_path: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let openrouter_api_key =
            var("OPENROUTER_API_KEY").ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;

        // an unreadable temperature falls back to the default instead of failing startup
        let temperature = var("TEMPERATURE")
            .and_then(|value| value.parse::<f32>().ok())
            .filter(|t| t.is_finite())
            .unwrap_or(DEFAULT_TEMPERATURE);

        let ocr_max_pdf_pages = match var("OCR_MAX_PDF_PAGES") {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|pages| *pages > 0)
                .ok_or(ConfigError::Invalid {
                    name: "OCR_MAX_PDF_PAGES",
                    value,
                })?,
            None => DEFAULT_OCR_MAX_PDF_PAGES,
        };

        let heartbeat_seconds = match var("SSE_STAGE_HEARTBEAT_SECONDS") {
            Some(value) => value
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .ok_or(ConfigError::Invalid {
                    name: "SSE_STAGE_HEARTBEAT_SECONDS",
                    value,
                })?,
            None => DEFAULT_HEARTBEAT_SECONDS,
        };

        let port = match var("PORT") {
            Some(value) => value
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { name: "PORT", value })?,
            None => DEFAULT_PORT,
        };

        let max_upload_bytes = match var("MAX_UPLOAD_MB") {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|mb| *mb > 0)
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .ok_or(ConfigError::Invalid {
                    name: "MAX_UPLOAD_MB",
                    value,
                })?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        Ok(Self {
            openrouter_api_key,
            model: var("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature,
            ocr_model: var("OCR_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ocr_max_pdf_pages,
            heartbeat: Duration::from_secs_f64(heartbeat_seconds),
            port,
            max_upload_bytes,
            database_url: var("DATABASE_URL"),
            clinical_policy_path: var("CLINICAL_POLICY_PATH"),
        })
    }
}
