use serde::Serialize;

use crate::config::WebToolsConfig;

const SPECIAL_NAMESPACE: &str = "Special";

/// What the host knows about the page being rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageContext {
    /// Stable identifier used in cache keys.
    pub page_id: String,
    pub display_title: String,
    pub full_url: String,
    pub is_main_page: bool,
    pub is_special: bool,
    pub is_talk: bool,
    pub content_language: String,
}

impl PageContext {
    /// Build the context for a title the way the wiki would see it.
    pub fn for_title(config: &WebToolsConfig, title: &str) -> Self {
        let title = normalize_title(title);
        let namespace = namespace_of(&title);
        let is_special = namespace.is_some_and(|ns| ns.eq_ignore_ascii_case(SPECIAL_NAMESPACE));
        let is_talk = namespace.is_some_and(is_talk_namespace);
        let base = config.wiki_url().unwrap_or_default();
        let full_url = format!(
            "{base}{}",
            config.article_path().replace("$1", &encode_title(&title))
        );
        Self {
            page_id: title.clone(),
            is_main_page: !is_special && title == normalize_title(config.main_page()),
            display_title: title,
            full_url,
            is_special,
            is_talk,
            content_language: config.content_language().to_string(),
        }
    }
}

/// Static facts about the wiki itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteFacts {
    pub site_name: String,
    /// Absolute logo URL, empty when no logo is configured.
    pub logo_url: String,
    pub content_language: String,
}

impl SiteFacts {
    pub fn from_config(config: &WebToolsConfig) -> Self {
        let server = config.wiki_url().unwrap_or_default();
        let logo_url = config
            .site
            .logo
            .as_deref()
            .map(|logo| expand_url(&server, logo))
            .unwrap_or_default();
        Self {
            site_name: config.site_name().to_string(),
            logo_url,
            content_language: config.content_language().to_string(),
        }
    }
}

/// Make a site-relative or protocol-relative URL absolute against `server`.
pub fn expand_url(server: &str, url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.contains("://") {
        return url.to_string();
    }
    let server = server.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("//") {
        let scheme = server
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("https");
        return format!("{scheme}://{rest}");
    }
    if url.starts_with('/') {
        format!("{server}{url}")
    } else {
        format!("{server}/{url}")
    }
}

fn normalize_title(title: &str) -> String {
    title.replace('_', " ").trim().to_string()
}

fn encode_title(title: &str) -> String {
    title.trim().replace(' ', "_")
}

fn namespace_of(title: &str) -> Option<&str> {
    title
        .split_once(':')
        .map(|(namespace, _)| namespace.trim())
        .filter(|namespace| !namespace.is_empty())
}

fn is_talk_namespace(namespace: &str) -> bool {
    let lower = namespace.to_ascii_lowercase();
    lower == "talk" || lower.ends_with(" talk")
}
