//! OpenGraph / Twitter tag resolution for a single page render.
//!
//! Description and image come from the summary provider through a one-week
//! read-through cache. Every failure along that path degrades to "no dynamic
//! value" so rendering never breaks; the static settings fill the gaps.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};

use crate::cache::{METADATA_TTL, MetadataCache, MetadataField, cache_key};
use crate::page::{PageContext, SiteFacts};
use crate::settings::{SettingKey, SettingsStore, SettingsValues};
use crate::summary::{PageSummary, SummaryProvider};

/// Insertion-ordered tag name to content mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTagSet {
    tags: Vec<(String, String)>,
}

impl ResolvedTagSet {
    /// Replaces in place when the tag exists, appends otherwise.
    pub fn insert(&mut self, name: &str, content: impl Into<String>) {
        let content = content.into();
        match self.tags.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = content,
            None => self.tags.push((name.to_string(), content)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, content)| content.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.tags.iter().position(|(existing, _)| existing == name)?;
        Some(self.tags.remove(index).1)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_str()))
    }

    fn retain_non_empty(&mut self) {
        self.tags.retain(|(_, content)| !content.is_empty());
    }
}

impl Serialize for ResolvedTagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tags.len()))?;
        for (name, content) in &self.tags {
            map.serialize_entry(name, content)?;
        }
        map.end()
    }
}

/// Only ordinary content pages get per-page description and image.
pub fn wants_dynamic_data(page: &PageContext) -> bool {
    !page.is_main_page && !page.is_special && !page.is_talk
}

pub struct MetadataResolver<'a> {
    settings: &'a SettingsStore,
    cache: &'a dyn MetadataCache,
    provider: &'a dyn SummaryProvider,
    site: &'a SiteFacts,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(
        settings: &'a SettingsStore,
        cache: &'a dyn MetadataCache,
        provider: &'a dyn SummaryProvider,
        site: &'a SiteFacts,
    ) -> Self {
        Self {
            settings,
            cache,
            provider,
            site,
        }
    }

    pub fn resolve(&self, page: &PageContext) -> ResolvedTagSet {
        self.resolve_with(&self.settings.get_values(), page)
    }

    /// Resolve against settings the caller already loaded for this render.
    pub fn resolve_with(&self, settings: &SettingsValues, page: &PageContext) -> ResolvedTagSet {
        let mut tags = ResolvedTagSet::default();
        if !settings.flag(SettingKey::OpenGraphActivate) {
            return tags;
        }
        let static_description = settings.text(SettingKey::OpenGraphDescription);

        if page.is_main_page {
            tags.insert("og:type", "site");
            tags.insert("og:title", self.site.site_name.as_str());
        } else {
            tags.insert("og:type", "article");
            tags.insert("og:title", page.display_title.as_str());
        }
        tags.insert("og:url", page.full_url.as_str());
        tags.insert("og:locale", page.content_language.as_str());
        tags.insert("og:image", self.site.logo_url.as_str());
        tags.insert("og:description", static_description);

        let app_id = settings.text(SettingKey::FacebookAppId);
        if !app_id.is_empty() {
            tags.insert("fb:app_id", app_id);
        }

        let mut use_twitter = false;
        for (key, name) in [
            (SettingKey::TwitterSite, "twitter:site"),
            (SettingKey::TwitterCreator, "twitter:creator"),
        ] {
            let handle = settings.text(key);
            if !handle.is_empty() {
                tags.insert(name, handle);
                use_twitter = true;
            }
        }
        if use_twitter {
            tags.insert("twitter:card", "summary");
        }

        if wants_dynamic_data(page) {
            let mut dynamic = self.cached_values(&page.page_id);
            tags.insert(
                "og:description",
                dynamic.remove(&MetadataField::Description).unwrap_or_default(),
            );
            tags.insert(
                "og:image",
                dynamic.remove(&MetadataField::Image).unwrap_or_default(),
            );
        }

        if tags.get("og:image").is_none_or(str::is_empty)
            && settings.flag(SettingKey::OpenGraphFallbackOnLogo)
        {
            tags.insert("og:image", self.site.logo_url.as_str());
        }
        if tags.get("og:description").is_none_or(str::is_empty) && !static_description.is_empty()
        {
            tags.insert("og:description", static_description);
        }

        tags.retain_non_empty();
        tags
    }

    /// Refresh both cached fields for a page after its content changed.
    ///
    /// One provider call covers both fields; a failed call stores empty
    /// markers for both. The pair goes to the cache as one write, so a failed
    /// write leaves the previous pair in place.
    pub fn regenerate(&self, page_id: &str) -> Result<PageSummary> {
        let summary = self.fetch_or_empty(page_id, &MetadataField::ALL);
        let entries = cache_entries(page_id, &MetadataField::ALL, &summary);
        self.cache
            .set_many(&entries, METADATA_TTL)
            .with_context(|| format!("failed to store regenerated metadata for {page_id}"))?;
        tracing::debug!(page_id, "regenerated cached metadata");
        Ok(summary)
    }

    fn cached_values(&self, page_id: &str) -> HashMap<MetadataField, String> {
        let mut values = HashMap::new();
        let mut missing = Vec::new();
        for field in MetadataField::ALL {
            match self.cache.get(&cache_key(page_id, field)) {
                Ok(Some(value)) => {
                    tracing::debug!(page_id, %field, "metadata cache hit");
                    values.insert(field, value);
                }
                Ok(None) => missing.push(field),
                Err(error) => {
                    tracing::warn!(page_id, %field, error = %format!("{error:#}"), "metadata cache read failed");
                    missing.push(field);
                }
            }
        }
        if missing.is_empty() {
            return values;
        }

        tracing::debug!(page_id, ?missing, "metadata cache miss");
        let summary = self.fetch_or_empty(page_id, &missing);
        let entries = cache_entries(page_id, &missing, &summary);
        if let Err(error) = self.cache.set_many(&entries, METADATA_TTL) {
            tracing::warn!(page_id, error = %format!("{error:#}"), "metadata cache write failed");
        }
        for (field, (_, value)) in missing.into_iter().zip(entries) {
            values.insert(field, value);
        }
        values
    }

    fn fetch_or_empty(&self, page_id: &str, fields: &[MetadataField]) -> PageSummary {
        match self.provider.fetch(page_id, fields) {
            Ok(summary) => summary,
            Err(error) => {
                tracing::warn!(page_id, error = %format!("{error:#}"), "summary provider unavailable");
                PageSummary::default()
            }
        }
    }
}

/// Cache entries for `fields`; a field the summary lacks becomes an empty marker.
fn cache_entries(
    page_id: &str,
    fields: &[MetadataField],
    summary: &PageSummary,
) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|&field| {
            (
                cache_key(page_id, field),
                summary.value(field).unwrap_or("").to_string(),
            )
        })
        .collect()
}
