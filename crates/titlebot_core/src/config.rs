use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub const DEFAULT_USER_AGENT: &str = "titlebot/0.3";
pub const DEFAULT_PAGE_TITLE: &str = "Module:QC/titles";
pub const DEFAULT_SOURCE_URL: &str = "https://questionablecontent.net/archive.php";
pub const DEFAULT_CACHE_FILE: &str = "archive.php";
pub const DEFAULT_MARKER_FILE: &str = ".titlebot-last-run";
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 600;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub archive: ArchiveSection,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub page: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct ArchiveSection {
    pub source_url: Option<String>,
    pub cache_file: Option<PathBuf>,
    pub cache_max_age_secs: Option<u64>,
    pub http_timeout_ms: Option<u64>,
    pub marker_file: Option<PathBuf>,
}

impl BotConfig {
    /// Resolve the wiki API URL: env TITLEBOT_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        if let Some(value) = env_value("TITLEBOT_API_URL") {
            return Some(value);
        }
        self.wiki.api_url.clone()
    }

    /// Resolve user agent: env TITLEBOT_USER_AGENT > config > default.
    pub fn user_agent(&self) -> String {
        env_value("TITLEBOT_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the target page title: env TITLEBOT_PAGE > config > default.
    pub fn page_title(&self) -> String {
        env_value("TITLEBOT_PAGE")
            .or_else(|| self.wiki.page.clone())
            .unwrap_or_else(|| DEFAULT_PAGE_TITLE.to_string())
    }

    /// Resolve the archive URL: env TITLEBOT_SOURCE_URL > config > default.
    pub fn source_url(&self) -> String {
        env_value("TITLEBOT_SOURCE_URL")
            .or_else(|| self.archive.source_url.clone())
            .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string())
    }

    pub fn cache_file(&self) -> PathBuf {
        self.archive
            .cache_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FILE))
    }

    pub fn cache_max_age_secs(&self) -> u64 {
        self.archive
            .cache_max_age_secs
            .unwrap_or(DEFAULT_CACHE_MAX_AGE_SECS)
    }

    pub fn http_timeout_ms(&self) -> u64 {
        self.archive.http_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
    }

    pub fn marker_file(&self) -> PathBuf {
        self.archive
            .marker_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MARKER_FILE))
    }
}

/// Load a BotConfig from a TOML file. Returns default if the file is absent.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Bot account credentials, taken from the environment only.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub fn credentials_from_env() -> Result<Credentials> {
    let username = match env_value("TITLEBOT_USER") {
        Some(value) => value,
        None => bail!("TITLEBOT_USER is required to edit the wiki"),
    };
    let password = match env_value("TITLEBOT_PASS") {
        Some(value) => value,
        None => bail!("TITLEBOT_PASS is required to edit the wiki"),
    };
    Ok(Credentials { username, password })
}

/// Per-run options resolved once from the command line and passed by
/// parameter everywhere. No ambient state.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub page: String,
    pub data_file: PathBuf,
    pub summary_note: Option<String>,
    pub auto: bool,
    pub no_download: bool,
    pub max_cycles: usize,
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.auto && self.no_download {
            bail!("--auto cannot be combined with --no-download");
        }
        if self.page.trim().is_empty() {
            bail!("target page title cannot be empty");
        }
        if self.max_cycles == 0 {
            bail!("--max-cycles must be at least 1");
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}
