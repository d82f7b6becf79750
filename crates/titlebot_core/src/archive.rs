use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;

use crate::config::BotConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOrigin {
    /// Read from the local copy because downloading was disabled.
    LocalOnly,
    /// Cache file was younger than the freshness window.
    FreshCache,
    /// Fetched over HTTP and written back to the cache file.
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct ArchiveText {
    pub text: String,
    pub origin: ArchiveOrigin,
    /// Non-fatal trouble while refreshing the cache copy, for the operator.
    pub warning: Option<String>,
}

/// Where the archive listing text comes from. The production implementation
/// is [`ArchiveFetcher`]; runner tests supply canned text.
pub trait ArchiveSource {
    fn load(&self, no_download: bool) -> Result<ArchiveText>;
}

pub struct ArchiveFetcher {
    client: Client,
    user_agent: String,
    source_url: String,
    cache_file: PathBuf,
    cache_max_age: Duration,
}

impl ArchiveFetcher {
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms()))
            .build()
            .context("failed to build archive HTTP client")?;
        Ok(Self {
            client,
            user_agent: config.user_agent(),
            source_url: config.source_url(),
            cache_file: config.cache_file(),
            cache_max_age: Duration::from_secs(config.cache_max_age_secs()),
        })
    }

    fn download(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.source_url)
            .header("User-Agent", self.user_agent.clone())
            .send()
            .with_context(|| format!("failed to fetch {}", self.source_url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} while fetching {}", status.as_u16(), self.source_url);
        }
        let bytes = response.bytes().context("failed to read archive body")?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl ArchiveSource for ArchiveFetcher {
    /// Obtain the archive listing text. With `no_download` the local copy is
    /// the only source; otherwise a sufficiently fresh cache file short
    /// circuits the HTTP fetch. The cache file is shared without locking;
    /// the single-operator usage model accepts a racing second invocation.
    fn load(&self, no_download: bool) -> Result<ArchiveText> {
        if no_download {
            let text = read_lossy(&self.cache_file).with_context(|| {
                format!(
                    "--no-download requires a local copy at {}",
                    self.cache_file.display()
                )
            })?;
            return Ok(ArchiveText {
                text,
                origin: ArchiveOrigin::LocalOnly,
                warning: None,
            });
        }

        if is_fresh(&self.cache_file, self.cache_max_age) {
            let text = read_lossy(&self.cache_file)
                .with_context(|| format!("failed to read {}", self.cache_file.display()))?;
            return Ok(ArchiveText {
                text,
                origin: ArchiveOrigin::FreshCache,
                warning: None,
            });
        }

        let text = self.download()?;
        // A stale cache only costs a redundant download next run.
        let warning = fs::write(&self.cache_file, &text).err().map(|error| {
            format!(
                "failed to update cache {}: {error}",
                self.cache_file.display()
            )
        });
        Ok(ArchiveText {
            text,
            origin: ArchiveOrigin::Downloaded,
            warning,
        })
    }
}

/// UTF-8 with errors ignored; the archive page carries stray bytes.
fn read_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn is_fresh(path: &Path, max_age: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < max_age,
        // Clock skew put the mtime in the future; treat as not fresh.
        Err(_) => false,
    }
}
