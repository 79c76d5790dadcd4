use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "webtools/0.2";
pub const DEFAULT_ARTICLE_PATH: &str = "/wiki/$1";
pub const DEFAULT_SITE_NAME: &str = "Wiki";
pub const DEFAULT_MAIN_PAGE: &str = "Main Page";
pub const DEFAULT_CONTENT_LANGUAGE: &str = "en";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 350;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WebToolsConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub features: FeatureSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub name: Option<String>,
    pub url: Option<String>,
    pub logo: Option<String>,
    pub article_path: Option<String>,
    pub main_page: Option<String>,
    pub content_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

/// Site-wide switches an operator sets outside the admin form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FeatureSection {
    #[serde(default = "enabled")]
    pub allow_google_analytics: bool,
    #[serde(default = "enabled")]
    pub text_extracts: bool,
    #[serde(default = "enabled")]
    pub page_images: bool,
}

impl Default for FeatureSection {
    fn default() -> Self {
        Self {
            allow_google_analytics: true,
            text_extracts: true,
            page_images: true,
        }
    }
}

fn enabled() -> bool {
    true
}

impl WebToolsConfig {
    /// Resolve the wiki base URL: env WIKI_URL > config > derived from api url.
    pub fn wiki_url(&self) -> Option<String> {
        if let Some(value) = env_override("WIKI_URL") {
            return Some(value);
        }
        if let Some(ref url) = self.site.url {
            return Some(url.trim_end_matches('/').to_string());
        }
        self.api_url().and_then(|api| derive_wiki_url(&api))
    }

    /// Resolve the action API URL: env WIKI_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        if let Some(value) = env_override("WIKI_API_URL") {
            return Some(value);
        }
        self.api.url.clone()
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_override("WIKI_USER_AGENT") {
            return value;
        }
        self.api
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn http_timeout(&self) -> Duration {
        let millis = env_override("WIKI_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.api.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Duration::from_millis(millis)
    }

    pub fn http_retries(&self) -> usize {
        env_override("WIKI_HTTP_RETRIES")
            .and_then(|value| value.parse::<usize>().ok())
            .or(self.api.retries)
            .unwrap_or(DEFAULT_RETRIES)
    }

    pub fn http_retry_delay(&self) -> Duration {
        let millis = env_override("WIKI_HTTP_RETRY_DELAY_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.api.retry_delay_ms)
            .unwrap_or(DEFAULT_RETRY_DELAY_MS);
        Duration::from_millis(millis)
    }

    pub fn site_name(&self) -> &str {
        self.site.name.as_deref().unwrap_or(DEFAULT_SITE_NAME)
    }

    pub fn article_path(&self) -> &str {
        self.site
            .article_path
            .as_deref()
            .unwrap_or(DEFAULT_ARTICLE_PATH)
    }

    pub fn main_page(&self) -> &str {
        self.site.main_page.as_deref().unwrap_or(DEFAULT_MAIN_PAGE)
    }

    pub fn content_language(&self) -> &str {
        self.site
            .content_language
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_LANGUAGE)
    }
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Load and parse a WebToolsConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WebToolsConfig> {
    if !config_path.exists() {
        return Ok(WebToolsConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WebToolsConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Derive wiki base URL from an API URL by stripping `/api.php` or `/w/api.php`.
pub fn derive_wiki_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let result = stripped.trim_end_matches('/').to_string();
    if result.is_empty() { None } else { Some(result) }
}
