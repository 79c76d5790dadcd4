use crate::metadata::ResolvedTagSet;
use crate::settings::{SettingKey, SettingsValues};

const TWITTER_TAGS: [&str; 3] = ["twitter:card", "twitter:site", "twitter:creator"];

/// The `<head>` of the page being rendered, as exposed by the host.
pub trait HeadOutput {
    /// Names of meta tags already added by anyone.
    fn meta_names(&self) -> Vec<String>;
    fn add_meta(&mut self, name: &str, content: &str);
    /// Raw head HTML under a unique key; a repeated key replaces the item.
    fn add_head_item(&mut self, key: &str, html: String);
    fn add_script(&mut self, html: String);
}

/// Collects head output and renders it as HTML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadBuffer {
    pub metas: Vec<(String, String)>,
    pub head_items: Vec<(String, String)>,
    pub scripts: Vec<String>,
}

impl HeadOutput for HeadBuffer {
    fn meta_names(&self) -> Vec<String> {
        self.metas.iter().map(|(name, _)| name.clone()).collect()
    }

    fn add_meta(&mut self, name: &str, content: &str) {
        self.metas.push((name.to_string(), content.to_string()));
    }

    fn add_head_item(&mut self, key: &str, html: String) {
        match self.head_items.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, slot)) => *slot = html,
            None => self.head_items.push((key.to_string(), html)),
        }
    }

    fn add_script(&mut self, html: String) {
        self.scripts.push(html);
    }
}

impl HeadBuffer {
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for (name, content) in &self.metas {
            let attribute = if name.starts_with("og:") || name.starts_with("fb:") {
                "property"
            } else {
                "name"
            };
            lines.push(meta_element(attribute, name, content));
        }
        lines.extend(self.head_items.iter().map(|(_, html)| html.clone()));
        lines.extend(self.scripts.iter().cloned());
        lines.join("\n")
    }
}

/// Write resolved tags into the head.
///
/// `og:image` goes first and only when nothing else has emitted one; Twitter
/// tags are plain `name=` meta elements added as head items. Returns whether
/// `og:image` was written.
pub fn inject_meta_tags(out: &mut dyn HeadOutput, tags: &ResolvedTagSet) -> bool {
    let mut tags = tags.clone();
    let mut wrote_image = false;
    if let Some(image) = tags.remove("og:image") {
        if out.meta_names().iter().any(|name| name == "og:image") {
            tracing::debug!("og:image already present; leaving it in place");
        } else {
            out.add_meta("og:image", &image);
            wrote_image = true;
        }
    }

    for name in TWITTER_TAGS {
        if let Some(content) = tags.remove(name) {
            out.add_head_item(&format!("meta:{name}"), meta_element("name", name, &content));
        }
    }

    for (name, content) in tags.iter() {
        out.add_meta(name, content);
    }
    wrote_image
}

/// gtag.js snippet for the page, when analytics applies to it.
pub fn analytics_script(
    settings: &SettingsValues,
    page_title: &str,
    analytics_allowed: bool,
) -> Option<String> {
    if !analytics_allowed {
        return None;
    }
    let google_id = settings.text(SettingKey::GoogleAnalyticsId).trim();
    if google_id.is_empty() || settings.excluded_titles().contains(&page_title) {
        return None;
    }
    let id = escape_attribute(google_id);
    let config_line = if settings.flag(SettingKey::GoogleAnonymizeIp) {
        format!("\tgtag('config', '{id}', {{ 'anonymize_ip': true }} );")
    } else {
        format!("\tgtag('config', '{id}');")
    };
    Some(
        [
            format!(
                "<script async src=\"https://www.googletagmanager.com/gtag/js?id={id}\"></script>"
            ),
            "<script>".to_string(),
            "\twindow.dataLayer = window.dataLayer || [];".to_string(),
            "\tfunction gtag(){dataLayer.push(arguments);}".to_string(),
            "\tgtag('js', new Date());".to_string(),
            config_line,
            "</script>".to_string(),
        ]
        .join("\n"),
    )
}

fn meta_element(attribute: &str, name: &str, content: &str) -> String {
    format!(
        "<meta {attribute}=\"{}\" content=\"{}\"/>",
        escape_attribute(name),
        escape_attribute(content)
    )
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
