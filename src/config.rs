use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub kb: KbConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KbConfig {
    /// Path to the panic-codes workbook (one sheet per language).
    pub workbook: PathBuf,
    /// Sheet used when the request carries no language tag, and the sheet
    /// the known-code list is generated from.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Retries per individual API call (attempts = max_retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Full image-analysis passes before giving up on a code.
    #[serde(default = "default_passes")]
    pub passes: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fallback wait when a rate-limited response suggests no delay.
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,
    /// Exponential backoff base for timeouts and server errors.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            passes: default_passes(),
            timeout_secs: default_timeout_secs(),
            rate_limit_wait_secs: default_rate_limit_wait_secs(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_passes() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    90
}
fn default_rate_limit_wait_secs() -> u64 {
    20
}
fn default_backoff_base_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimiterConfig {
    /// Failed re-analysis attempts allowed before a key is blocked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Cooldown applied once the attempt limit is reached.
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            cooldown_hours: default_cooldown_hours(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}
fn default_cooldown_hours() -> i64 {
    3
}

impl InferenceConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// A config usable without a config file (lookup-only commands).
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/triage.sqlite"),
            },
            kb: KbConfig {
                workbook: PathBuf::from("./data/panic_codes.xlsx"),
                language: default_language(),
            },
            inference: InferenceConfig::default(),
            limiter: LimiterConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.kb.language.trim().is_empty() {
        anyhow::bail!("kb.language must not be empty");
    }

    match config.inference.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown inference provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.inference.passes == 0 {
        anyhow::bail!("inference.passes must be >= 1");
    }

    if config.limiter.max_attempts == 0 {
        anyhow::bail!("limiter.max_attempts must be >= 1");
    }

    if config.limiter.cooldown_hours < 1 {
        anyhow::bail!("limiter.cooldown_hours must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "./data/t.sqlite"
            [kb]
            workbook = "./data/codes.xlsx"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.kb.language, "en");
        assert_eq!(cfg.inference.provider, "disabled");
        assert_eq!(cfg.inference.max_retries, 2);
        assert_eq!(cfg.inference.passes, 2);
        assert_eq!(cfg.limiter.max_attempts, 2);
        assert_eq!(cfg.limiter.cooldown_hours, 3);
        assert!(!cfg.inference.is_enabled());
    }

    #[test]
    fn rejects_unknown_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        std::fs::write(
            &path,
            r#"
            [db]
            path = "./t.sqlite"
            [kb]
            workbook = "./codes.xlsx"
            [inference]
            provider = "anthropic"
            "#,
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }
}
