use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;

use crate::cache::MetadataField;
use crate::config::WebToolsConfig;

pub const EXTRACT_CHARS: usize = 200;
pub const THUMBNAIL_SIZE: u32 = 240;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub description: Option<String>,
    pub image: Option<String>,
}

impl PageSummary {
    pub fn value(&self, field: MetadataField) -> Option<&str> {
        match field {
            MetadataField::Description => self.description.as_deref(),
            MetadataField::Image => self.image.as_deref(),
        }
    }
}

/// Source of page intro text and thumbnails.
pub trait SummaryProvider: Send + Sync {
    /// Fetch only the requested fields, in a single round trip.
    fn fetch(&self, title: &str, fields: &[MetadataField]) -> Result<PageSummary>;
}

/// Used when the wiki has no summary source configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSummaryProvider;

impl SummaryProvider for DisabledSummaryProvider {
    fn fetch(&self, _title: &str, _fields: &[MetadataField]) -> Result<PageSummary> {
        Ok(PageSummary::default())
    }
}

/// Connection settings for [`MediaWikiSummaryProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryOptions {
    pub api_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub retries: usize,
    pub retry_delay: Duration,
    pub text_extracts: bool,
    pub page_images: bool,
}

impl SummaryOptions {
    /// `None` when no action API URL is configured.
    pub fn from_config(config: &WebToolsConfig) -> Option<Self> {
        Self::for_api_url(config, config.api_url())
    }

    fn for_api_url(config: &WebToolsConfig, api_url: Option<String>) -> Option<Self> {
        Some(Self {
            api_url: api_url?,
            user_agent: config.user_agent(),
            timeout: config.http_timeout(),
            retries: config.http_retries(),
            retry_delay: config.http_retry_delay(),
            text_extracts: config.features.text_extracts,
            page_images: config.features.page_images,
        })
    }
}

/// Queries `prop=extracts|pageimages` on a MediaWiki action API.
pub struct MediaWikiSummaryProvider {
    client: Client,
    options: SummaryOptions,
}

impl MediaWikiSummaryProvider {
    pub fn new(options: SummaryOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .context("failed to build summary HTTP client")?;
        Ok(Self { client, options })
    }

    pub fn from_config(config: &WebToolsConfig) -> Result<Option<Self>> {
        SummaryOptions::from_config(config).map(Self::new).transpose()
    }

    fn request_json(&self, params: &[(&str, String)]) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format", "json".to_string()));
        pairs.push(("formatversion", "2".to_string()));
        pairs.extend(params.iter().map(|(key, value)| (*key, value.clone())));

        let mut last_error = None::<String>;
        for attempt in 0..=self.options.retries {
            if attempt > 0 {
                sleep(self.options.retry_delay.saturating_mul(attempt as u32));
            }
            let response = self
                .client
                .get(&self.options.api_url)
                .header("User-Agent", self.options.user_agent.clone())
                .query(&pairs)
                .send();
            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    last_error = Some(error.to_string());
                    continue;
                }
            };
            if !response.status().is_success() {
                last_error = Some(format!("HTTP {}", response.status()));
                continue;
            }
            let payload: Value = response
                .json()
                .context("failed to decode summary API JSON response")?;
            if let Some(error) = payload.get("error") {
                let code = error
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown_error");
                let info = error
                    .get("info")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown info");
                last_error = Some(format!("api error [{code}]: {info}"));
                continue;
            }
            return Ok(payload);
        }

        let message = last_error.unwrap_or_else(|| "summary API request failed".to_string());
        bail!("{message}")
    }
}

impl SummaryProvider for MediaWikiSummaryProvider {
    fn fetch(&self, title: &str, fields: &[MetadataField]) -> Result<PageSummary> {
        let Some(params) = summary_query(
            title,
            fields,
            self.options.text_extracts,
            self.options.page_images,
        ) else {
            return Ok(PageSummary::default());
        };
        tracing::debug!(title, ?fields, "querying summary API");
        let payload = self
            .request_json(&params)
            .with_context(|| format!("summary lookup failed for {title}"))?;
        Ok(parse_summary_payload(&payload, fields))
    }
}

/// Query parameters for the requested fields, or `None` when no enabled
/// module can answer them.
pub fn summary_query(
    title: &str,
    fields: &[MetadataField],
    text_extracts: bool,
    page_images: bool,
) -> Option<Vec<(&'static str, String)>> {
    let mut props = Vec::new();
    if text_extracts && fields.contains(&MetadataField::Description) {
        props.push("extracts");
    }
    if page_images && fields.contains(&MetadataField::Image) {
        props.push("pageimages");
    }
    if props.is_empty() {
        return None;
    }
    Some(vec![
        ("action", "query".to_string()),
        ("titles", title.to_string()),
        ("prop", props.join("|")),
        ("exchars", EXTRACT_CHARS.to_string()),
        ("exsectionformat", "plain".to_string()),
        ("explaintext", "1".to_string()),
        ("exintro", "1".to_string()),
        ("piprop", "thumbnail".to_string()),
        ("pithumbsize", THUMBNAIL_SIZE.to_string()),
    ])
}

/// Pull the extract and thumbnail out of a `formatversion=2` query response.
pub fn parse_summary_payload(payload: &Value, fields: &[MetadataField]) -> PageSummary {
    let Some(page) = payload
        .get("query")
        .and_then(|value| value.get("pages"))
        .and_then(Value::as_array)
        .and_then(|pages| pages.first())
    else {
        return PageSummary::default();
    };
    if page.get("missing").is_some() || page.get("invalid").is_some() {
        return PageSummary::default();
    }

    let description = page
        .get("extract")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|extract| !extract.is_empty())
        .map(ToString::to_string);
    let image = page
        .get("thumbnail")
        .and_then(|value| value.get("source"))
        .and_then(Value::as_str)
        .filter(|source| !source.trim().is_empty())
        .map(ToString::to_string);

    PageSummary {
        description: description.filter(|_| fields.contains(&MetadataField::Description)),
        image: image.filter(|_| fields.contains(&MetadataField::Image)),
    }
}
