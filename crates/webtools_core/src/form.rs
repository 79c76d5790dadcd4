use serde::Serialize;
use thiserror::Error;

use crate::config::WebToolsConfig;
use crate::page::PageContext;
use crate::settings::{
    SettingKey, SettingsError, SettingsStore, SettingsValues, UpdateReport,
    validate_google_analytics_id,
};

pub const SETTINGS_RIGHT: &str = "webtoolsmanagement";
pub const SETTINGS_PAGE: &str = "Special:WebToolsManager";

/// The user asking for the settings page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    pub name: String,
    pub rights: Vec<String>,
}

impl Viewer {
    pub fn new(name: impl Into<String>, rights: &[&str]) -> Self {
        Self {
            name: name.into(),
            rights: rights.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn has_right(&self, right: &str) -> bool {
        self.rights.iter().any(|granted| granted == right)
    }
}

#[derive(Debug, Error)]
pub enum FormError {
    #[error("`{viewer}` lacks the `webtoolsmanagement` right")]
    PermissionDenied { viewer: String },
    #[error("{field}: {source}")]
    Invalid {
        field: SettingKey,
        #[source]
        source: SettingsError,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormSection {
    OpenGraph,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Toggle,
    Text,
    TextArea,
    Titles,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormField {
    pub key: SettingKey,
    pub kind: FieldKind,
    pub section: FormSection,
    pub value: Option<String>,
    /// Open graph fields are greyed out while the feature is off.
    pub disabled: bool,
}

const OPEN_GRAPH_FIELDS: [(SettingKey, FieldKind); 6] = [
    (SettingKey::OpenGraphActivate, FieldKind::Toggle),
    (SettingKey::OpenGraphFallbackOnLogo, FieldKind::Toggle),
    (SettingKey::OpenGraphDescription, FieldKind::TextArea),
    (SettingKey::FacebookAppId, FieldKind::Text),
    (SettingKey::TwitterSite, FieldKind::Text),
    (SettingKey::TwitterCreator, FieldKind::Text),
];

const ANALYTICS_FIELDS: [(SettingKey, FieldKind); 3] = [
    (SettingKey::GoogleAnalyticsId, FieldKind::Text),
    (SettingKey::GoogleAnonymizeIp, FieldKind::Toggle),
    (SettingKey::AnalyticsExcludeTitles, FieldKind::Titles),
];

pub fn form_fields(values: &SettingsValues, allow_analytics: bool) -> Vec<FormField> {
    let open_graph_on = values.flag(SettingKey::OpenGraphActivate);
    let mut fields = OPEN_GRAPH_FIELDS
        .into_iter()
        .map(|(key, kind)| FormField {
            key,
            kind,
            section: FormSection::OpenGraph,
            value: values.get(key).map(ToString::to_string),
            disabled: key != SettingKey::OpenGraphActivate && !open_graph_on,
        })
        .collect::<Vec<_>>();
    if allow_analytics {
        fields.extend(ANALYTICS_FIELDS.into_iter().map(|(key, kind)| FormField {
            key,
            kind,
            section: FormSection::Analytics,
            value: values.get(key).map(ToString::to_string),
            disabled: false,
        }));
    }
    fields
}

/// Settings page backed by a store.
pub struct SettingsForm<'a> {
    store: &'a SettingsStore,
    allow_analytics: bool,
}

impl<'a> SettingsForm<'a> {
    pub fn new(store: &'a SettingsStore, allow_analytics: bool) -> Self {
        Self {
            store,
            allow_analytics,
        }
    }

    pub fn open(&self, viewer: &Viewer) -> Result<Vec<FormField>, FormError> {
        authorize(viewer)?;
        Ok(form_fields(&self.store.get_values(), self.allow_analytics))
    }

    /// Validate and persist a submission. Nothing is written when any field
    /// is rejected.
    pub fn submit<'d, I>(&self, viewer: &Viewer, data: I) -> Result<UpdateReport, FormError>
    where
        I: IntoIterator<Item = (&'d str, &'d str)>,
    {
        authorize(viewer)?;

        let mut entries = Vec::new();
        let mut hidden = Vec::new();
        for (raw_key, value) in data {
            let Some(key) = SettingKey::parse(raw_key) else {
                entries.push((raw_key.to_string(), Some(value.to_string())));
                continue;
            };
            if !self.allow_analytics && ANALYTICS_FIELDS.iter().any(|(field, _)| *field == key) {
                hidden.push(raw_key.to_string());
                continue;
            }
            if key == SettingKey::GoogleAnalyticsId {
                validate_google_analytics_id(value)
                    .map_err(|source| FormError::Invalid { field: key, source })?;
            }
            let value = if key.is_toggle() {
                toggle_value(value).to_string()
            } else {
                value.to_string()
            };
            entries.push((key.as_str().to_string(), Some(value)));
        }

        let mut report = self.store.update(entries)?;
        report.dropped.extend(hidden);
        tracing::info!(viewer = %viewer.name, stored = report.stored.len(), "settings updated");
        Ok(report)
    }
}

fn authorize(viewer: &Viewer) -> Result<(), FormError> {
    if viewer.has_right(SETTINGS_RIGHT) {
        Ok(())
    } else {
        Err(FormError::PermissionDenied {
            viewer: viewer.name.clone(),
        })
    }
}

fn toggle_value(value: &str) -> &'static str {
    let value = value.trim();
    let off = value.is_empty()
        || value == "0"
        || ["false", "off", "no"]
            .iter()
            .any(|word| value.eq_ignore_ascii_case(word));
    if off { "0" } else { "1" }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationLink {
    pub href: String,
    pub active: bool,
}

/// User-menu link to the settings page, shown only to authorized viewers.
pub fn settings_link(
    viewer: &Viewer,
    config: &WebToolsConfig,
    current: &PageContext,
) -> Option<NavigationLink> {
    if !viewer.has_right(SETTINGS_RIGHT) {
        return None;
    }
    let target = PageContext::for_title(config, SETTINGS_PAGE);
    Some(NavigationLink {
        active: current.page_id == target.page_id,
        href: target.full_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::tests::MemoryPersistence;

    fn admin() -> Viewer {
        Viewer::new("Admin", &["edit", SETTINGS_RIGHT])
    }

    #[test]
    fn open_requires_right() {
        let store = SettingsStore::new(MemoryPersistence::default());
        let form = SettingsForm::new(&store, true);
        let error = form
            .open(&Viewer::new("Reader", &["read"]))
            .expect_err("must be rejected");
        assert!(matches!(error, FormError::PermissionDenied { .. }));
        assert!(error.to_string().contains("webtoolsmanagement"));
    }

    #[test]
    fn open_graph_fields_follow_activation_toggle() {
        let mut values = SettingsValues::default();
        let fields = form_fields(&values, true);
        assert_eq!(fields.len(), SettingKey::ALL.len());
        let disabled = fields.iter().filter(|field| field.disabled).count();
        assert_eq!(disabled, 5);

        values.set(SettingKey::OpenGraphActivate, Some("1".to_string()));
        assert!(form_fields(&values, false).iter().all(|field| !field.disabled));
        assert_eq!(form_fields(&values, false).len(), 6);
    }

    #[test]
    fn invalid_analytics_id_rejects_whole_submission() {
        let store = SettingsStore::new(MemoryPersistence::default());
        let form = SettingsForm::new(&store, true);
        let error = form
            .submit(
                &admin(),
                [
                    ("opengraph-activate", "1"),
                    ("analytics-google-id", "UA-1-1"),
                ],
            )
            .expect_err("must fail");
        match error {
            FormError::Invalid { field, .. } => assert_eq!(field, SettingKey::GoogleAnalyticsId),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.get_values(), SettingsValues::default());
    }

    #[test]
    fn submit_normalizes_toggles_and_drops_extras() {
        let store = SettingsStore::new(MemoryPersistence::default());
        let form = SettingsForm::new(&store, false);
        let report = form
            .submit(
                &admin(),
                [
                    ("opengraph-activate", "true"),
                    ("opengraph-fallbackOnLogo", ""),
                    ("opengraph-twitter-site", "@wiki"),
                    ("analytics-google-id", "UA-123456789-1"),
                    ("wpEditToken", "abc"),
                ],
            )
            .expect("submit");
        assert_eq!(report.stored.len(), 3);
        assert_eq!(
            report.dropped,
            vec!["wpEditToken".to_string(), "analytics-google-id".to_string()]
        );

        let values = store.get_values();
        assert_eq!(values.get(SettingKey::OpenGraphActivate), Some("1"));
        assert_eq!(values.get(SettingKey::OpenGraphFallbackOnLogo), Some("0"));
        assert_eq!(values.text(SettingKey::TwitterSite), "@wiki");
        assert_eq!(values.text(SettingKey::GoogleAnalyticsId), "");
    }

    #[test]
    fn settings_link_only_for_authorized_viewers() {
        let config = WebToolsConfig::default();
        let here = PageContext::for_title(&config, SETTINGS_PAGE);
        let link = settings_link(&admin(), &config, &here).expect("link");
        assert!(link.active);
        assert!(link.href.ends_with("/wiki/Special:WebToolsManager"));
        assert_eq!(settings_link(&Viewer::default(), &config, &here), None);
    }
}
