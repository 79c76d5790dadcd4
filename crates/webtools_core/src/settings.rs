use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use thiserror::Error;

use crate::migrate::open_existing_connection;

/// Every configuration key the admin form can persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SettingKey {
    #[serde(rename = "analytics-google-id")]
    GoogleAnalyticsId,
    #[serde(rename = "analytics-google-anonymizeip")]
    GoogleAnonymizeIp,
    #[serde(rename = "analytics-exclude-titles")]
    AnalyticsExcludeTitles,
    #[serde(rename = "opengraph-activate")]
    OpenGraphActivate,
    #[serde(rename = "opengraph-fallbackOnLogo")]
    OpenGraphFallbackOnLogo,
    #[serde(rename = "opengraph-description")]
    OpenGraphDescription,
    #[serde(rename = "opengraph-facebook-appid")]
    FacebookAppId,
    #[serde(rename = "opengraph-twitter-site")]
    TwitterSite,
    #[serde(rename = "opengraph-twitter-creator")]
    TwitterCreator,
}

impl SettingKey {
    pub const ALL: [SettingKey; 9] = [
        Self::GoogleAnalyticsId,
        Self::GoogleAnonymizeIp,
        Self::AnalyticsExcludeTitles,
        Self::OpenGraphActivate,
        Self::OpenGraphFallbackOnLogo,
        Self::OpenGraphDescription,
        Self::FacebookAppId,
        Self::TwitterSite,
        Self::TwitterCreator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleAnalyticsId => "analytics-google-id",
            Self::GoogleAnonymizeIp => "analytics-google-anonymizeip",
            Self::AnalyticsExcludeTitles => "analytics-exclude-titles",
            Self::OpenGraphActivate => "opengraph-activate",
            Self::OpenGraphFallbackOnLogo => "opengraph-fallbackOnLogo",
            Self::OpenGraphDescription => "opengraph-description",
            Self::FacebookAppId => "opengraph-facebook-appid",
            Self::TwitterSite => "opengraph-twitter-site",
            Self::TwitterCreator => "opengraph-twitter-creator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }

    pub fn default_value(self) -> Option<&'static str> {
        match self {
            Self::GoogleAnalyticsId => Some(""),
            Self::GoogleAnonymizeIp => Some("1"),
            Self::AnalyticsExcludeTitles => None,
            Self::OpenGraphActivate => Some("0"),
            Self::OpenGraphFallbackOnLogo => Some("1"),
            Self::OpenGraphDescription => Some(""),
            Self::FacebookAppId => Some(""),
            Self::TwitterSite => Some(""),
            Self::TwitterCreator => Some(""),
        }
    }

    /// Keys rendered as on/off toggles and stored as `"0"` / `"1"`.
    pub fn is_toggle(self) -> bool {
        matches!(
            self,
            Self::GoogleAnonymizeIp | Self::OpenGraphActivate | Self::OpenGraphFallbackOnLogo
        )
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The static key/default table.
pub fn definition() -> Vec<(SettingKey, Option<&'static str>)> {
    SettingKey::ALL
        .into_iter()
        .map(|key| (key, key.default_value()))
        .collect()
}

pub fn valid_keys() -> Vec<&'static str> {
    SettingKey::ALL.into_iter().map(SettingKey::as_str).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("invalid Google Analytics ID `{value}` (expected UA-#########-#)")]
    InvalidGoogleAnalyticsId { value: String },
}

/// Accepts an empty value or an id shaped `UA-<9 digits>-<digits>`.
pub fn validate_google_analytics_id(value: &str) -> Result<(), SettingsError> {
    if value.is_empty() || is_google_analytics_id(value) {
        return Ok(());
    }
    Err(SettingsError::InvalidGoogleAnalyticsId {
        value: value.to_string(),
    })
}

fn is_google_analytics_id(value: &str) -> bool {
    let Some(rest) = value.strip_prefix("UA-") else {
        return false;
    };
    let Some((account, property)) = rest.split_once('-') else {
        return false;
    };
    account.len() == 9
        && account.bytes().all(|byte| byte.is_ascii_digit())
        && !property.is_empty()
        && property.bytes().all(|byte| byte.is_ascii_digit())
}

/// Defaults merged with persisted overrides; always holds every key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SettingsValues {
    values: BTreeMap<SettingKey, Option<String>>,
}

impl Default for SettingsValues {
    fn default() -> Self {
        Self {
            values: definition()
                .into_iter()
                .map(|(key, default)| (key, default.map(ToString::to_string)))
                .collect(),
        }
    }
}

impl SettingsValues {
    pub fn get(&self, key: SettingKey) -> Option<&str> {
        self.values.get(&key).and_then(|value| value.as_deref())
    }

    /// Value as text, with null read as empty.
    pub fn text(&self, key: SettingKey) -> &str {
        self.get(key).unwrap_or("")
    }

    /// Truthy unless null, empty or `"0"`.
    pub fn flag(&self, key: SettingKey) -> bool {
        matches!(self.get(key), Some(value) if !value.is_empty() && value != "0")
    }

    pub fn excluded_titles(&self) -> Vec<&str> {
        self.text(SettingKey::AnalyticsExcludeTitles)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn set(&mut self, key: SettingKey, value: Option<String>) {
        self.values.insert(key, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingKey, Option<&str>)> + '_ {
        self.values
            .iter()
            .map(|(key, value)| (*key, value.as_deref()))
    }

    /// Owned `(key, value)` pairs, suitable for feeding back into `update`.
    pub fn to_entries(&self) -> Vec<(String, Option<String>)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str().to_string(), value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingRow {
    pub key: String,
    pub value: Option<String>,
}

/// Flat `(key, value)` table the settings live in.
pub trait SettingsPersistence: Send + Sync {
    fn read_all(&self) -> Result<Vec<SettingRow>>;
    /// Upsert keyed by `key`; rows not mentioned stay untouched.
    fn replace_rows(&self, rows: &[SettingRow]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsPersistence {
    db_path: PathBuf,
}

impl SqliteSettingsPersistence {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl SettingsPersistence for SqliteSettingsPersistence {
    fn read_all(&self) -> Result<Vec<SettingRow>> {
        let connection = open_existing_connection(&self.db_path)?;
        let mut statement = connection
            .prepare("SELECT wtc_key, wtc_value FROM webtools_config")
            .context("failed to prepare webtools_config select")?;
        let rows = statement
            .query_map([], |row| {
                Ok(SettingRow {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .context("failed to query webtools_config")?;
        let mut output = Vec::new();
        for row in rows {
            output.push(row.context("failed to decode webtools_config row")?);
        }
        Ok(output)
    }

    fn replace_rows(&self, rows: &[SettingRow]) -> Result<()> {
        let mut connection = open_existing_connection(&self.db_path)?;
        let transaction = connection
            .transaction()
            .context("failed to start settings transaction")?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO webtools_config (wtc_key, wtc_value) VALUES (?1, ?2)
                     ON CONFLICT(wtc_key) DO UPDATE SET wtc_value = excluded.wtc_value",
                )
                .context("failed to prepare webtools_config upsert")?;
            for row in rows {
                statement
                    .execute(params![row.key, row.value])
                    .with_context(|| format!("failed to store setting {}", row.key))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit settings transaction")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub stored: Vec<SettingKey>,
    pub dropped: Vec<String>,
}

pub struct SettingsStore {
    persistence: Box<dyn SettingsPersistence>,
}

impl SettingsStore {
    pub fn new(persistence: impl SettingsPersistence + 'static) -> Self {
        Self {
            persistence: Box::new(persistence),
        }
    }

    pub fn sqlite(db_path: impl Into<PathBuf>) -> Self {
        Self::new(SqliteSettingsPersistence::new(db_path))
    }

    /// Never fails: a broken read degrades to the defaults.
    pub fn get_values(&self) -> SettingsValues {
        let mut values = SettingsValues::default();
        let rows = match self.persistence.read_all() {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "settings read failed; using defaults");
                return values;
            }
        };
        for row in rows {
            match SettingKey::parse(&row.key) {
                Some(key) => values.set(key, row.value),
                None => tracing::debug!(key = %row.key, "ignoring unknown stored setting"),
            }
        }
        values
    }

    pub fn update<I, K>(&self, entries: I) -> Result<UpdateReport>
    where
        I: IntoIterator<Item = (K, Option<String>)>,
        K: AsRef<str>,
    {
        let mut report = UpdateReport::default();
        let mut rows = Vec::new();
        for (raw_key, value) in entries {
            let raw_key = raw_key.as_ref();
            match SettingKey::parse(raw_key) {
                Some(key) => {
                    report.stored.push(key);
                    rows.push(SettingRow {
                        key: key.as_str().to_string(),
                        value,
                    });
                }
                None => {
                    tracing::debug!(key = %raw_key, "dropping unknown setting key");
                    report.dropped.push(raw_key.to_string());
                }
            }
        }
        if !rows.is_empty() {
            self.persistence
                .replace_rows(&rows)
                .context("failed to persist settings")?;
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::migrate::run_migrations;
    use crate::migrate::tests::test_paths;

    /// In-memory table with the same upsert semantics as the SQLite one.
    #[derive(Default)]
    pub(crate) struct MemoryPersistence {
        rows: Mutex<BTreeMap<String, Option<String>>>,
    }

    impl MemoryPersistence {
        pub(crate) fn with(entries: &[(&str, &str)]) -> Self {
            let persistence = Self::default();
            for (key, value) in entries {
                persistence
                    .rows
                    .lock()
                    .insert(key.to_string(), Some(value.to_string()));
            }
            persistence
        }
    }

    impl SettingsPersistence for MemoryPersistence {
        fn read_all(&self) -> Result<Vec<SettingRow>> {
            Ok(self
                .rows
                .lock()
                .iter()
                .map(|(key, value)| SettingRow {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect())
        }

        fn replace_rows(&self, rows: &[SettingRow]) -> Result<()> {
            let mut table = self.rows.lock();
            for row in rows {
                table.insert(row.key.clone(), row.value.clone());
            }
            Ok(())
        }
    }

    struct BrokenPersistence;

    impl SettingsPersistence for BrokenPersistence {
        fn read_all(&self) -> Result<Vec<SettingRow>> {
            anyhow::bail!("no such table: webtools_config")
        }

        fn replace_rows(&self, _rows: &[SettingRow]) -> Result<()> {
            anyhow::bail!("database is locked")
        }
    }

    #[test]
    fn google_analytics_id_validation() {
        for valid in ["", "UA-123456789-1", "UA-000000000-42"] {
            assert!(validate_google_analytics_id(valid).is_ok(), "{valid}");
        }
        for invalid in [
            "UA-12345678-1",
            "UA-1234567890-1",
            "UA-123456789-",
            "UA-123456789",
            "ua-123456789-1",
            "UA-123456789-1x",
            "G-ABCDEF1234",
            " ",
        ] {
            assert_eq!(
                validate_google_analytics_id(invalid),
                Err(SettingsError::InvalidGoogleAnalyticsId {
                    value: invalid.to_string()
                }),
                "{invalid}"
            );
        }
    }

    #[test]
    fn defaults_cover_every_key() {
        let store = SettingsStore::new(MemoryPersistence::default());
        let values = store.get_values();
        assert_eq!(values.iter().count(), SettingKey::ALL.len());
        assert_eq!(values.get(SettingKey::OpenGraphActivate), Some("0"));
        assert_eq!(values.get(SettingKey::AnalyticsExcludeTitles), None);
        assert!(values.flag(SettingKey::OpenGraphFallbackOnLogo));
        assert!(!values.flag(SettingKey::OpenGraphActivate));
    }

    #[test]
    fn read_failure_degrades_to_defaults() {
        let store = SettingsStore::new(BrokenPersistence);
        assert_eq!(store.get_values(), SettingsValues::default());
        assert!(store.update([("opengraph-activate", Some("1".to_string()))]).is_err());
    }

    #[test]
    fn update_drops_unknown_keys_and_keeps_others() {
        let store = SettingsStore::new(MemoryPersistence::with(&[(
            "opengraph-description",
            "Welcome",
        )]));
        let report = store
            .update([
                ("opengraph-activate", Some("1".to_string())),
                ("not-a-setting", Some("x".to_string())),
            ])
            .expect("update");
        assert_eq!(report.stored, vec![SettingKey::OpenGraphActivate]);
        assert_eq!(report.dropped, vec!["not-a-setting".to_string()]);

        let values = store.get_values();
        assert!(values.flag(SettingKey::OpenGraphActivate));
        assert_eq!(values.text(SettingKey::OpenGraphDescription), "Welcome");
        assert!(values.iter().all(|(key, _)| key.as_str() != "not-a-setting"));
    }

    #[test]
    fn sqlite_store_upserts_and_round_trips() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let store = SettingsStore::sqlite(&paths.db_path);

        store
            .update([
                ("analytics-google-id", Some("UA-123456789-1".to_string())),
                ("analytics-exclude-titles", Some("Main Page\nSandbox".to_string())),
            ])
            .expect("first update");
        store
            .update([("analytics-google-id", Some("UA-987654321-2".to_string()))])
            .expect("second update");

        let values = store.get_values();
        assert_eq!(values.text(SettingKey::GoogleAnalyticsId), "UA-987654321-2");
        assert_eq!(values.excluded_titles(), vec!["Main Page", "Sandbox"]);

        let rows = SqliteSettingsPersistence::new(&paths.db_path)
            .read_all()
            .expect("rows");
        assert_eq!(rows.len(), 2);

        store.update(values.to_entries()).expect("round trip");
        assert_eq!(store.get_values(), values);
    }

    #[test]
    fn sqlite_store_without_schema_reads_defaults() {
        let (_temp, paths) = test_paths();
        let store = SettingsStore::sqlite(&paths.db_path);
        assert_eq!(store.get_values(), SettingsValues::default());
        assert!(!paths.db_path.exists());
        assert!(
            store
                .update([("opengraph-activate", Some("1".to_string()))])
                .is_err()
        );
        assert!(!paths.db_path.exists());
    }
}
