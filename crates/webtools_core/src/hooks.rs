use anyhow::{Context, Result};

use crate::cache::{MetadataCache, SqliteCache};
use crate::config::{WebToolsConfig, load_config};
use crate::form::{NavigationLink, SettingsForm, Viewer, settings_link};
use crate::metadata::MetadataResolver;
use crate::output::{HeadOutput, analytics_script, inject_meta_tags};
use crate::page::{PageContext, SiteFacts};
use crate::runtime::ResolvedPaths;
use crate::settings::SettingsStore;
use crate::summary::{
    DisabledSummaryProvider, MediaWikiSummaryProvider, PageSummary, SummaryProvider,
};

/// Host notifications the extension reacts to.
pub enum HostEvent<'e> {
    BeforePageDisplay {
        page: &'e PageContext,
        out: &'e mut dyn HeadOutput,
    },
    PageSaveComplete {
        page_id: &'e str,
    },
}

/// The extension with all of its collaborators wired in.
pub struct WebTools {
    config: WebToolsConfig,
    site: SiteFacts,
    settings: SettingsStore,
    cache: Box<dyn MetadataCache>,
    provider: Box<dyn SummaryProvider>,
}

impl WebTools {
    pub fn new(
        config: WebToolsConfig,
        settings: SettingsStore,
        cache: Box<dyn MetadataCache>,
        provider: Box<dyn SummaryProvider>,
    ) -> Self {
        Self {
            site: SiteFacts::from_config(&config),
            config,
            settings,
            cache,
            provider,
        }
    }

    /// SQLite settings and cache under the runtime data dir, MediaWiki API
    /// summaries when an API URL is configured.
    pub fn from_paths(paths: &ResolvedPaths) -> Result<Self> {
        let config = load_config(&paths.config_path)?;
        let provider = MediaWikiSummaryProvider::from_config(&config)
            .context("failed to set up summary provider")?;
        let provider: Box<dyn SummaryProvider> = match provider {
            Some(provider) => Box::new(provider),
            None => {
                tracing::debug!("no API URL configured; dynamic page summaries disabled");
                Box::new(DisabledSummaryProvider)
            }
        };
        Ok(Self::new(
            config,
            SettingsStore::sqlite(&paths.db_path),
            Box::new(SqliteCache::new(&paths.db_path)),
            provider,
        ))
    }

    pub fn config(&self) -> &WebToolsConfig {
        &self.config
    }

    pub fn site(&self) -> &SiteFacts {
        &self.site
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn resolver(&self) -> MetadataResolver<'_> {
        MetadataResolver::new(&self.settings, &*self.cache, &*self.provider, &self.site)
    }

    pub fn form(&self) -> SettingsForm<'_> {
        SettingsForm::new(&self.settings, self.config.features.allow_google_analytics)
    }

    pub fn page(&self, title: &str) -> PageContext {
        PageContext::for_title(&self.config, title)
    }

    pub fn navigation_link(
        &self,
        viewer: &Viewer,
        current: &PageContext,
    ) -> Option<NavigationLink> {
        settings_link(viewer, &self.config, current)
    }

    pub fn handle(&self, event: HostEvent<'_>) {
        match event {
            HostEvent::BeforePageDisplay { page, out } => self.on_before_page_display(page, out),
            HostEvent::PageSaveComplete { page_id } => {
                if let Err(error) = self.on_page_save_complete(page_id) {
                    tracing::warn!(
                        page_id,
                        error = %format!("{error:#}"),
                        "metadata regeneration failed"
                    );
                }
            }
        }
    }

    /// Add the analytics snippet and social tags to the page head.
    pub fn on_before_page_display(&self, page: &PageContext, out: &mut dyn HeadOutput) {
        let settings = self.settings.get_values();
        if let Some(script) = analytics_script(
            &settings,
            &page.display_title,
            self.config.features.allow_google_analytics,
        ) {
            out.add_script(script);
        }

        let tags = self.resolver().resolve_with(&settings, page);
        if !tags.is_empty() {
            inject_meta_tags(out, &tags);
        }
    }

    /// Refresh cached description and image right after an edit.
    pub fn on_page_save_complete(&self, page_id: &str) -> Result<PageSummary> {
        self.resolver().regenerate(page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SiteSection;
    use crate::form::SETTINGS_RIGHT;
    use crate::metadata::tests::RecordingProvider;
    use crate::output::HeadBuffer;
    use crate::settings::tests::MemoryPersistence;

    fn webtools(settings: &[(&str, &str)], provider: RecordingProvider) -> WebTools {
        let config = WebToolsConfig {
            site: SiteSection {
                name: Some("Example Wiki".to_string()),
                url: Some("https://wiki.example.org".to_string()),
                logo: Some("/images/logo.png".to_string()),
                ..SiteSection::default()
            },
            ..WebToolsConfig::default()
        };
        WebTools::new(
            config,
            SettingsStore::new(MemoryPersistence::with(settings)),
            Box::new(MemoryCache::default()),
            Box::new(provider),
        )
    }

    #[test]
    fn before_display_writes_script_and_tags() {
        let tools = webtools(
            &[
                ("opengraph-activate", "1"),
                ("analytics-google-id", "UA-123456789-1"),
            ],
            RecordingProvider::answering("About the example.", "https://img/ex.png"),
        );
        let page = tools.page("Example");
        let mut head = HeadBuffer::default();
        tools.handle(HostEvent::BeforePageDisplay {
            page: &page,
            out: &mut head,
        });

        assert_eq!(head.scripts.len(), 1);
        assert_eq!(head.metas[0].0, "og:image");
        assert_eq!(head.metas[0].1, "https://img/ex.png");
        assert!(head.render().contains("content=\"About the example.\""));
    }

    #[test]
    fn disabled_features_leave_head_untouched() {
        let tools = webtools(&[], RecordingProvider::answering("d", "i"));
        let page = tools.page("Example");
        let mut head = HeadBuffer::default();
        tools.on_before_page_display(&page, &mut head);
        assert_eq!(head, HeadBuffer::default());
    }

    #[test]
    fn save_event_refreshes_before_next_render() {
        let tools = webtools(
            &[("opengraph-activate", "1")],
            RecordingProvider::answering("After edit.", "https://img/after.png"),
        );
        tools.handle(HostEvent::PageSaveComplete { page_id: "Example" });

        let tags = tools.resolver().resolve(&tools.page("Example"));
        assert_eq!(tags.get("og:description"), Some("After edit."));
    }

    #[test]
    fn navigation_link_for_managers() {
        let tools = webtools(&[], RecordingProvider::answering("d", "i"));
        let page = tools.page("Example");
        let link = tools
            .navigation_link(&Viewer::new("Admin", &[SETTINGS_RIGHT]), &page)
            .expect("link");
        assert!(!link.active);
        assert!(tools.navigation_link(&Viewer::default(), &page).is_none());
    }
}
