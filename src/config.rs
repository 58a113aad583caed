use anyhow::{anyhow, Result};
use std::path::PathBuf;
use url::Url;

/// Validated, immutable configuration for one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Absolute base URL of the site, always with a trailing slash.
    pub base_url: String,
    /// Path under the base URL to discover links from; empty or
    /// trailing-slash terminated.
    pub crawl_path: String,
    /// CSS selector matching the link elements to archive.
    pub selector: String,
    /// Directory the archived files are written into.
    pub out_dir: PathBuf,
}

impl CrawlConfig {
    pub fn new(base_url: &str, crawl_path: &str, selector: &str, out_dir: PathBuf) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| anyhow!("Invalid base URL \"{}\": {}", base_url, e))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Base URL \"{}\" must use http or https",
                base_url
            ));
        }

        Ok(Self {
            base_url: with_trailing_slash(base_url.trim()),
            crawl_path: normalize_path(crawl_path),
            selector: default_selector(selector),
            out_dir,
        })
    }

    /// The URL link discovery starts from: base URL plus crawl path.
    pub fn target_url(&self) -> String {
        format!("{}{}", self.base_url, self.crawl_path)
    }

    /// Folder name for the optional per-site subdirectory: the site's
    /// domain with dots replaced by underscores.
    pub fn site_dir_name(&self) -> String {
        let stripped = self
            .base_url
            .strip_prefix("https://")
            .or_else(|| self.base_url.strip_prefix("http://"))
            .unwrap_or(&self.base_url)
            .trim_end_matches('/');

        stripped
            .split('/')
            .next()
            .unwrap_or(stripped)
            .replace('.', "_")
    }
}

fn with_trailing_slash(value: &str) -> String {
    if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        with_trailing_slash(trimmed)
    }
}

fn default_selector(selector: &str) -> String {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        "a".to_string()
    } else {
        trimmed.to_string()
    }
}
