use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::migrate::open_existing_connection;

const UPSERT_ENTRY: &str =
    "INSERT INTO metadata_cache (cache_key, value, expires_at_unix) VALUES (?1, ?2, ?3)
     ON CONFLICT(cache_key) DO UPDATE SET
        value = excluded.value,
        expires_at_unix = excluded.expires_at_unix";

pub const CACHE_NAMESPACE: &str = "webtoolsmanager";
pub const METADATA_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Page-derived values kept in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataField {
    Description,
    Image,
}

impl MetadataField {
    pub const ALL: [MetadataField; 2] = [Self::Description, Self::Image];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Description => "description",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn cache_key(page_id: &str, field: MetadataField) -> String {
    format!("{CACHE_NAMESPACE}:meta:{page_id}:{}", field.as_str())
}

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        unix_now().unwrap_or(0)
    }
}

pub(crate) fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs())
}

/// Shared key/value store with per-entry expiry.
///
/// `Ok(None)` means the value was never computed or has expired. An empty
/// string is a real value: it records that the lookup ran and found nothing.
pub trait MetadataCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Store several entries as one write. The default loops over `set` and
    /// can stop halfway; backends that can write all-or-nothing override it.
    fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value, ttl)?;
        }
        Ok(())
    }

    /// Read-through lookup for a single key: on a miss, `compute` runs and its
    /// result is stored. `MetadataResolver` does not use it, since it batches
    /// every missing field of a page into one provider call.
    fn get_or_compute(
        &self,
        key: &str,
        ttl: Duration,
        compute: &mut dyn FnMut() -> String,
    ) -> Result<String> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = compute();
        self.set(key, &value, ttl)?;
        Ok(value)
    }
}

struct MemoryEntry {
    value: String,
    expires_at: u64,
}

/// Process-local cache.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryCache {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_unix();
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());
        if fresh.is_none() {
            entries.remove(key);
        }
        Ok(fresh)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now_unix().saturating_add(ttl.as_secs());
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now_unix().saturating_add(ttl.as_secs());
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(
                key.clone(),
                MemoryEntry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(())
    }
}

/// Cache table in the webtools SQLite database, shared across processes.
pub struct SqliteCache {
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self::with_clock(db_path, Arc::new(SystemClock))
    }

    pub fn with_clock(db_path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db_path: db_path.into(),
            clock,
        }
    }

    /// Delete expired rows; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let connection = open_existing_connection(&self.db_path)?;
        connection
            .execute(
                "DELETE FROM metadata_cache WHERE expires_at_unix <= ?1",
                params![to_sql_time(self.clock.now_unix())?],
            )
            .context("failed to purge expired metadata_cache rows")
    }
}

impl MetadataCache for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let connection = open_existing_connection(&self.db_path)?;
        connection
            .query_row(
                "SELECT value FROM metadata_cache WHERE cache_key = ?1 AND expires_at_unix > ?2",
                params![key, to_sql_time(self.clock.now_unix())?],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read cache entry {key}"))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now_unix().saturating_add(ttl.as_secs());
        let connection = open_existing_connection(&self.db_path)?;
        connection
            .execute(UPSERT_ENTRY, params![key, value, to_sql_time(expires_at)?])
            .with_context(|| format!("failed to write cache entry {key}"))?;
        Ok(())
    }

    fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        let expires_at = to_sql_time(self.clock.now_unix().saturating_add(ttl.as_secs()))?;
        let mut connection = open_existing_connection(&self.db_path)?;
        let transaction = connection
            .transaction()
            .context("failed to start metadata_cache transaction")?;
        {
            let mut statement = transaction
                .prepare(UPSERT_ENTRY)
                .context("failed to prepare metadata_cache upsert")?;
            for (key, value) in entries {
                statement
                    .execute(params![key, value, expires_at])
                    .with_context(|| format!("failed to write cache entry {key}"))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit metadata_cache transaction")
    }
}

fn to_sql_time(value: u64) -> Result<i64> {
    i64::try_from(value).context("timestamp does not fit into i64")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::migrate::run_migrations;
    use crate::migrate::tests::test_paths;

    pub(crate) struct ManualClock(AtomicU64);

    impl ManualClock {
        pub(crate) fn at(now: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(now)))
        }

        pub(crate) fn advance(&self, by: Duration) {
            self.0.fetch_add(by.as_secs(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_unix(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn cache_key_layout() {
        assert_eq!(
            cache_key("Example", MetadataField::Image),
            "webtoolsmanager:meta:Example:image"
        );
    }

    #[test]
    fn memory_cache_expires_after_ttl() {
        let clock = ManualClock::at(1_000);
        let cache = MemoryCache::with_clock(clock.clone());
        cache.set("k", "v", METADATA_TTL).expect("set");
        assert_eq!(cache.get("k").expect("get").as_deref(), Some("v"));

        clock.advance(METADATA_TTL);
        assert_eq!(cache.get("k").expect("get"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn empty_marker_is_a_hit() {
        let cache = MemoryCache::default();
        cache.set("k", "", METADATA_TTL).expect("set");
        let mut calls = 0;
        let value = cache
            .get_or_compute("k", METADATA_TTL, &mut || {
                calls += 1;
                "fresh".to_string()
            })
            .expect("read-through");
        assert_eq!(value, "");
        assert_eq!(calls, 0);
    }

    #[test]
    fn get_or_compute_stores_on_miss() {
        let cache = MemoryCache::default();
        let mut calls = 0;
        for _ in 0..2 {
            let value = cache
                .get_or_compute("k", METADATA_TTL, &mut || {
                    calls += 1;
                    "computed".to_string()
                })
                .expect("read-through");
            assert_eq!(value, "computed");
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn sqlite_cache_overwrites_and_expires() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let clock = ManualClock::at(50_000);
        let cache = SqliteCache::with_clock(&paths.db_path, clock.clone());

        let key = cache_key("Example", MetadataField::Description);
        assert_eq!(cache.get(&key).expect("get"), None);
        cache.set(&key, "first", METADATA_TTL).expect("set");
        cache.set(&key, "second", METADATA_TTL).expect("overwrite");
        assert_eq!(cache.get(&key).expect("get").as_deref(), Some("second"));

        clock.advance(METADATA_TTL + Duration::from_secs(1));
        assert_eq!(cache.get(&key).expect("get"), None);
        assert_eq!(cache.purge_expired().expect("purge"), 1);
    }

    #[test]
    fn sqlite_set_many_is_all_or_nothing() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("migrate");
        let cache = SqliteCache::new(&paths.db_path);
        let description = cache_key("Example", MetadataField::Description);
        let image = cache_key("Example", MetadataField::Image);
        cache
            .set_many(
                &[
                    (description.clone(), "old text".to_string()),
                    (image.clone(), "old.png".to_string()),
                ],
                METADATA_TTL,
            )
            .expect("seed");

        reject_image_writes(&paths.db_path);
        let result = cache.set_many(
            &[
                (description.clone(), "new text".to_string()),
                (image.clone(), "new.png".to_string()),
            ],
            METADATA_TTL,
        );
        assert!(result.is_err());
        assert_eq!(cache.get(&description).expect("get").as_deref(), Some("old text"));
        assert_eq!(cache.get(&image).expect("get").as_deref(), Some("old.png"));
    }

    #[test]
    fn sqlite_cache_does_not_create_database() {
        let (_temp, paths) = test_paths();
        let cache = SqliteCache::new(&paths.db_path);
        assert!(cache.get("k").is_err());
        assert!(cache.set("k", "v", METADATA_TTL).is_err());
        assert!(!paths.db_path.exists());
    }

    /// Installs triggers that abort any insert or update of an image entry.
    pub(crate) fn reject_image_writes(db_path: &std::path::Path) {
        let connection = rusqlite::Connection::open(db_path).expect("open");
        connection
            .execute_batch(
                "CREATE TRIGGER reject_image_insert BEFORE INSERT ON metadata_cache
                 WHEN NEW.cache_key LIKE '%:image'
                 BEGIN SELECT RAISE(ABORT, 'image writes rejected'); END;
                 CREATE TRIGGER reject_image_update BEFORE UPDATE ON metadata_cache
                 WHEN NEW.cache_key LIKE '%:image'
                 BEGIN SELECT RAISE(ABORT, 'image writes rejected'); END;",
            )
            .expect("install triggers");
    }
}
