use std::{collections::HashSet, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, QueryBuilder, Sqlite, SqlitePool,
};
use tokio::sync::Mutex;

use crate::{
    app_state::AppError,
    subtitles::SubtitleKind,
    utils::{now_secs, sha256_hex},
};

mod maintenance;
mod notifications;

pub use maintenance::*;
pub use notifications::*;

/// Ordered migration batches. `PRAGMA user_version` records how many have
/// been applied; running with a database that is behind is refused.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
CREATE TABLE IF NOT EXISTS language_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    languages TEXT NOT NULL,
    acceptance_threshold INTEGER NOT NULL DEFAULT 60,
    upgrade_threshold INTEGER NOT NULL DEFAULT 80,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS media_profiles (
    source_ref TEXT PRIMARY KEY,
    profile_id INTEGER NOT NULL,
    FOREIGN KEY (profile_id) REFERENCES language_profiles (id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS wanted_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL UNIQUE,
    item_kind TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    file_path TEXT NOT NULL,
    title TEXT NOT NULL,
    season INTEGER,
    episode INTEGER,
    year INTEGER,
    target_language TEXT NOT NULL,
    subtitle_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'wanted',
    missing_languages TEXT NOT NULL DEFAULT '[]',
    existing_subtitle_path TEXT,
    existing_score INTEGER,
    upgrade_candidate INTEGER NOT NULL DEFAULT 0,
    instance_name TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    failure_reason TEXT,
    profile_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (profile_id) REFERENCES language_profiles (id)
);
CREATE INDEX IF NOT EXISTS wanted_items_status ON wanted_items (status);
CREATE INDEX IF NOT EXISTS wanted_items_path ON wanted_items (file_path);
CREATE TABLE IF NOT EXISTS subtitle_downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    language TEXT NOT NULL,
    subtitle_type TEXT NOT NULL,
    provider TEXT NOT NULL,
    external_id TEXT,
    score INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT,
    downloaded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS subtitle_downloads_path ON subtitle_downloads (file_path);
CREATE TABLE IF NOT EXISTS blacklist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    subtitle_external_id TEXT NOT NULL,
    reason TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (provider, subtitle_external_id)
);
CREATE TABLE IF NOT EXISTS metadata_cache (
    cache_key TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    response_body TEXT NOT NULL,
    cached_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS translation_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_lang TEXT NOT NULL,
    target_lang TEXT NOT NULL,
    normalized_source_text TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    translated_text TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (source_lang, target_lang, text_hash)
);
CREATE TABLE IF NOT EXISTS filter_presets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    scope TEXT NOT NULL,
    condition_tree TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS hooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    event_filter TEXT NOT NULL DEFAULT '[]',
    command TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_exit_code INTEGER,
    last_run_at INTEGER
);
CREATE TABLE IF NOT EXISTS hook_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hook_id INTEGER NOT NULL,
    event_name TEXT NOT NULL,
    exit_code INTEGER,
    stdout TEXT NOT NULL DEFAULT '',
    stderr TEXT NOT NULL DEFAULT '',
    executed_at INTEGER NOT NULL,
    FOREIGN KEY (hook_id) REFERENCES hooks (id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    event_filter TEXT NOT NULL DEFAULT '[]',
    url TEXT NOT NULL,
    template TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_status INTEGER,
    last_run_at INTEGER
);
CREATE TABLE IF NOT EXISTS notification_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT,
    event_name TEXT,
    title_template TEXT NOT NULL,
    body_template TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS quiet_hours (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    start_minute INTEGER NOT NULL,
    end_minute INTEGER NOT NULL,
    days_of_week TEXT NOT NULL DEFAULT '[0,1,2,3,4,5,6]',
    exception_events TEXT NOT NULL DEFAULT '[]',
    enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS notification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    event_name TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    suppressed INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS subtitle_health_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL,
    score INTEGER NOT NULL,
    issues TEXT NOT NULL,
    checked_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS subtitle_health_path ON subtitle_health_results (file_path);
CREATE TABLE IF NOT EXISTS subtitle_content_hashes (
    file_path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    format TEXT NOT NULL,
    language TEXT,
    line_count INTEGER NOT NULL,
    scanned_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS subtitle_content_hash ON subtitle_content_hashes (content_hash);
CREATE TABLE IF NOT EXISTS cleanup_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    rule_type TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS cleanup_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    files_removed INTEGER NOT NULL DEFAULT 0,
    run_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS standalone_series (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    normalized_title TEXT NOT NULL,
    year INTEGER,
    metadata_provider TEXT,
    metadata_id TEXT,
    is_anime INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE (normalized_title, year)
);
CREATE TABLE IF NOT EXISTS standalone_movies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    normalized_title TEXT NOT NULL,
    year INTEGER,
    file_path TEXT NOT NULL UNIQUE,
    metadata_provider TEXT,
    metadata_id TEXT,
    is_anime INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
];

#[derive(Debug)]
pub struct Db {
    pub pool: SqlitePool,
    /// Single coarse write path. Every mutating method serializes on this
    /// lock; readers go straight to the pool.
    write_lock: Mutex<()>,
}

impl Db {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Private in-memory database, used by tests. A single connection keeps
    /// every query on the same memory store.
    pub async fn connect_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn schema_version(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
    }

    pub fn latest_schema_version() -> i64 {
        MIGRATIONS.len() as i64
    }

    pub async fn needs_migration(&self) -> Result<bool, sqlx::Error> {
        Ok(self.schema_version().await? < Self::latest_schema_version())
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let current = self.schema_version().await?;
        for (idx, batch) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= current {
                continue;
            }
            tracing::info!(version, "Applying schema migration");
            sqlx::raw_sql(batch).execute(&self.pool).await?;
            sqlx::raw_sql(&format!("PRAGMA user_version = {version}"))
                .execute(&self.pool)
                .await?;
        }
        self.seed_default_profile().await?;
        Ok(())
    }

    async fn seed_default_profile(&self) -> Result<(), sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM language_profiles")
            .fetch_one(&self.pool)
            .await?;
        if count == 0 {
            let languages = r#"[{"code":"en","enabled":true,"hearing_impaired":false,"forced_preference":"disabled"}]"#;
            sqlx::query(
                "INSERT INTO language_profiles (name, languages, acceptance_threshold, upgrade_threshold, created_at)
                 VALUES ('Default', ?, 60, 80, ?)",
            )
            .bind(languages)
            .bind(now_secs())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn state_get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn state_set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO app_state (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// Wanted items

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WantedStatus {
    Wanted,
    Searching,
    Downloaded,
    Translated,
    Ignored,
    Failed,
}

impl WantedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WantedStatus::Wanted => "wanted",
            WantedStatus::Searching => "searching",
            WantedStatus::Downloaded => "downloaded",
            WantedStatus::Translated => "translated",
            WantedStatus::Ignored => "ignored",
            WantedStatus::Failed => "failed",
        }
    }
}

impl FromStr for WantedStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wanted" => Ok(Self::Wanted),
            "searching" => Ok(Self::Searching),
            "downloaded" => Ok(Self::Downloaded),
            "translated" => Ok(Self::Translated),
            "ignored" => Ok(Self::Ignored),
            "failed" => Ok(Self::Failed),
            rest => Err(AppError::bad_request(format!("unknown status: {rest}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ItemKind {
    Episode,
    Movie,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WantedItem {
    pub id: i64,
    pub fingerprint: String,
    pub item_kind: ItemKind,
    pub source_ref: String,
    pub file_path: String,
    pub title: String,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub year: Option<i64>,
    pub target_language: String,
    pub subtitle_type: String,
    pub status: WantedStatus,
    pub missing_languages: String,
    pub existing_subtitle_path: Option<String>,
    pub existing_score: Option<i64>,
    pub upgrade_candidate: bool,
    pub instance_name: String,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub failure_reason: Option<String>,
    pub profile_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WantedItem {
    pub fn subtitle_kind(&self) -> SubtitleKind {
        self.subtitle_type.parse().unwrap_or(SubtitleKind::Full)
    }
}

#[derive(Debug, Clone)]
pub struct NewWantedItem {
    pub item_kind: ItemKind,
    pub source_ref: String,
    pub file_path: String,
    pub title: String,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub year: Option<i64>,
    pub target_language: String,
    pub subtitle_type: SubtitleKind,
    pub missing_languages: Vec<String>,
    pub existing_subtitle_path: Option<String>,
    pub existing_score: Option<i64>,
    pub upgrade_candidate: bool,
    pub instance_name: String,
    pub profile_id: i64,
}

/// Deterministic identity of a wanted item: one active item per
/// `(file_path, target_language, subtitle_type)`.
pub fn wanted_fingerprint(file_path: &str, language: &str, kind: SubtitleKind) -> String {
    let mut data = Vec::new();
    data.extend_from_slice(file_path.as_bytes());
    data.push(0);
    data.extend_from_slice(language.as_bytes());
    data.push(0);
    data.extend_from_slice(kind.to_string().as_bytes());
    sha256_hex(&data)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WantedFilters {
    pub item_type: Option<ItemKind>,
    pub status: Option<WantedStatus>,
    pub subtitle_type: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Server-side WHERE fragment compiled from a filter preset. Built only
    /// by [`crate::filters`], never from raw user input.
    #[serde(skip)]
    pub preset_clause: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct WantedSummary {
    pub total: i64,
    pub wanted: i64,
    pub searching: i64,
    pub downloaded: i64,
    pub translated: i64,
    pub ignored: i64,
    pub failed: i64,
}

const WANTED_SORT_FIELDS: [&str; 6] = [
    "title",
    "created_at",
    "updated_at",
    "attempts",
    "last_attempt_at",
    "target_language",
];

impl Db {
    /// Insert or refresh a wanted item keyed by its fingerprint. An existing
    /// row keeps its status and attempt counters; observed state (existing
    /// subtitle, upgrade candidacy, missing languages) is updated.
    pub async fn upsert_wanted_item(&self, new: NewWantedItem) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let fingerprint = wanted_fingerprint(
            &new.file_path,
            &new.target_language,
            new.subtitle_type,
        );
        let now = now_secs();
        let missing = serde_json::to_string(&new.missing_languages).unwrap_or_default();
        let subtitle_type = new.subtitle_type.to_string();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO wanted_items
            (fingerprint, item_kind, source_ref, file_path, title, season, episode, year,
             target_language, subtitle_type, missing_languages, existing_subtitle_path,
             existing_score, upgrade_candidate, instance_name, profile_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint) DO UPDATE SET
                source_ref = excluded.source_ref,
                title = excluded.title,
                season = excluded.season,
                episode = excluded.episode,
                year = excluded.year,
                missing_languages = excluded.missing_languages,
                existing_subtitle_path = excluded.existing_subtitle_path,
                existing_score = excluded.existing_score,
                upgrade_candidate = excluded.upgrade_candidate,
                profile_id = excluded.profile_id,
                updated_at = excluded.updated_at
            RETURNING id",
        )
        .bind(&fingerprint)
        .bind(new.item_kind)
        .bind(&new.source_ref)
        .bind(&new.file_path)
        .bind(&new.title)
        .bind(new.season)
        .bind(new.episode)
        .bind(new.year)
        .bind(&new.target_language)
        .bind(&subtitle_type)
        .bind(&missing)
        .bind(&new.existing_subtitle_path)
        .bind(new.existing_score)
        .bind(new.upgrade_candidate)
        .bind(&new.instance_name)
        .bind(new.profile_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_wanted(&self, id: i64) -> Result<WantedItem, sqlx::Error> {
        sqlx::query_as::<_, WantedItem>("SELECT * FROM wanted_items WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_wanted_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<WantedItem>, sqlx::Error> {
        sqlx::query_as::<_, WantedItem>("SELECT * FROM wanted_items WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_wanted(
        &self,
        filters: &WantedFilters,
    ) -> Result<Vec<WantedItem>, sqlx::Error> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM wanted_items WHERE 1 = 1");
        if let Some(kind) = filters.item_type {
            qb.push(" AND item_kind = ").push_bind(kind);
        }
        if let Some(status) = filters.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(subtitle_type) = &filters.subtitle_type {
            qb.push(" AND subtitle_type = ").push_bind(subtitle_type);
        }
        if let Some(search) = &filters.search {
            let like = format!("%{search}%");
            qb.push(" AND (title LIKE ").push_bind(like.clone());
            qb.push(" OR file_path LIKE ").push_bind(like);
            qb.push(")");
        }
        if let Some(clause) = &filters.preset_clause {
            qb.push(" AND (").push(clause.as_str()).push(")");
        }
        let sort_by = filters
            .sort_by
            .as_deref()
            .filter(|f| WANTED_SORT_FIELDS.contains(f))
            .unwrap_or("created_at");
        let sort_dir = match filters.sort_dir.as_deref() {
            Some("asc") => "ASC",
            _ => "DESC",
        };
        qb.push(format!(" ORDER BY {sort_by} {sort_dir}"));
        qb.push(" LIMIT ")
            .push_bind(filters.limit.unwrap_or(100).clamp(1, 500));
        qb.push(" OFFSET ").push_bind(filters.offset.unwrap_or(0));
        qb.build_query_as::<WantedItem>().fetch_all(&self.pool).await
    }

    pub async fn wanted_summary(&self) -> Result<WantedSummary, sqlx::Error> {
        sqlx::query_as::<_, WantedSummary>(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status = 'wanted'), 0) AS wanted,
                COALESCE(SUM(status = 'searching'), 0) AS searching,
                COALESCE(SUM(status = 'downloaded'), 0) AS downloaded,
                COALESCE(SUM(status = 'translated'), 0) AS translated,
                COALESCE(SUM(status = 'ignored'), 0) AS ignored,
                COALESCE(SUM(status = 'failed'), 0) AS failed
             FROM wanted_items",
        )
        .fetch_one(&self.pool)
        .await
    }

    /// Atomic status transition. Returns false when the row was not in any
    /// of the `from` states, which is how a worker learns it lost the claim.
    pub async fn transition_status(
        &self,
        id: i64,
        from: &[WantedStatus],
        to: WantedStatus,
    ) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE wanted_items SET status = ");
        qb.push_bind(to);
        qb.push(", updated_at = ").push_bind(now_secs());
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in from {
            separated.push_bind(*status);
        }
        qb.push(")");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Claim a batch of searchable items. Items already claimed by another
    /// worker are skipped by the per-row transition.
    pub async fn claim_search_batch(&self, limit: i64) -> Result<Vec<WantedItem>, sqlx::Error> {
        let candidates = sqlx::query_as::<_, WantedItem>(
            "SELECT * FROM wanted_items
             WHERE status = 'wanted'
             ORDER BY last_attempt_at IS NOT NULL, last_attempt_at ASC, created_at ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for item in candidates {
            if self
                .transition_status(item.id, &[WantedStatus::Wanted], WantedStatus::Searching)
                .await?
            {
                claimed.push(item);
            }
        }
        Ok(claimed)
    }

    pub async fn record_attempt(
        &self,
        id: i64,
        status: WantedStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE wanted_items
             SET status = ?, attempts = attempts + 1, last_attempt_at = ?,
                 failure_reason = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(now_secs())
        .bind(failure_reason)
        .bind(now_secs())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_wanted(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM wanted_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove library-managed items whose files are gone from the snapshot.
    /// Standalone items are reconciled by their own pass and never touched
    /// here.
    pub async fn cleanup_wanted_missing_files(
        &self,
        instance_name: &str,
        existing_paths: &HashSet<String>,
    ) -> Result<u64, sqlx::Error> {
        let rows = sqlx::query_as::<_, WantedItem>(
            "SELECT * FROM wanted_items WHERE instance_name = ?",
        )
        .bind(instance_name)
        .fetch_all(&self.pool)
        .await?;
        let mut removed = 0;
        for item in rows {
            if !existing_paths.contains(&item.file_path) {
                self.delete_wanted(item.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn wanted_for_path(&self, file_path: &str) -> Result<Vec<WantedItem>, sqlx::Error> {
        sqlx::query_as::<_, WantedItem>("SELECT * FROM wanted_items WHERE file_path = ?")
            .bind(file_path)
            .fetch_all(&self.pool)
            .await
    }
}

// Language profiles

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbLanguageProfile {
    pub id: i64,
    pub name: String,
    pub languages: String,
    pub acceptance_threshold: i64,
    pub upgrade_threshold: i64,
    pub created_at: i64,
}

impl Db {
    pub async fn upsert_profile(
        &self,
        name: &str,
        languages_json: &str,
        acceptance_threshold: i64,
        upgrade_threshold: i64,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO language_profiles (name, languages, acceptance_threshold, upgrade_threshold, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET
                languages = excluded.languages,
                acceptance_threshold = excluded.acceptance_threshold,
                upgrade_threshold = excluded.upgrade_threshold
             RETURNING id",
        )
        .bind(name)
        .bind(languages_json)
        .bind(acceptance_threshold)
        .bind(upgrade_threshold)
        .bind(now_secs())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_profile(&self, id: i64) -> Result<DbLanguageProfile, sqlx::Error> {
        sqlx::query_as::<_, DbLanguageProfile>("SELECT * FROM language_profiles WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_profiles(&self) -> Result<Vec<DbLanguageProfile>, sqlx::Error> {
        sqlx::query_as::<_, DbLanguageProfile>("SELECT * FROM language_profiles ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn delete_profile(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM language_profiles WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn assign_profile(&self, source_ref: &str, profile_id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO media_profiles (source_ref, profile_id) VALUES (?, ?)
             ON CONFLICT (source_ref) DO UPDATE SET profile_id = excluded.profile_id",
        )
        .bind(source_ref)
        .bind(profile_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Profile assigned to the media source, or the default (lowest id).
    pub async fn profile_for_source(
        &self,
        source_ref: &str,
    ) -> Result<DbLanguageProfile, sqlx::Error> {
        let assigned = sqlx::query_scalar::<_, i64>(
            "SELECT profile_id FROM media_profiles WHERE source_ref = ?",
        )
        .bind(source_ref)
        .fetch_optional(&self.pool)
        .await?;
        match assigned {
            Some(id) => self.get_profile(id).await,
            None => {
                sqlx::query_as::<_, DbLanguageProfile>(
                    "SELECT * FROM language_profiles ORDER BY id LIMIT 1",
                )
                .fetch_one(&self.pool)
                .await
            }
        }
    }
}

// Downloads and blacklist

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SubtitleDownload {
    pub id: i64,
    pub file_path: String,
    pub language: String,
    pub subtitle_type: String,
    pub provider: String,
    pub external_id: Option<String>,
    pub score: i64,
    pub size_bytes: i64,
    pub content_hash: Option<String>,
    pub downloaded_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlacklistEntry {
    pub id: i64,
    pub provider: String,
    pub subtitle_external_id: String,
    pub reason: Option<String>,
    pub created_at: i64,
}

impl Db {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_download(
        &self,
        file_path: &str,
        language: &str,
        subtitle_type: SubtitleKind,
        provider: &str,
        external_id: Option<&str>,
        score: i64,
        size_bytes: i64,
        content_hash: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO subtitle_downloads
             (file_path, language, subtitle_type, provider, external_id, score, size_bytes, content_hash, downloaded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(file_path)
        .bind(language)
        .bind(subtitle_type.to_string())
        .bind(provider)
        .bind(external_id)
        .bind(score)
        .bind(size_bytes)
        .bind(content_hash)
        .bind(now_secs())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn latest_download(
        &self,
        file_path: &str,
        language: &str,
        subtitle_type: &str,
    ) -> Result<Option<SubtitleDownload>, sqlx::Error> {
        sqlx::query_as::<_, SubtitleDownload>(
            "SELECT * FROM subtitle_downloads
             WHERE file_path = ? AND language = ? AND subtitle_type = ?
             ORDER BY downloaded_at DESC, id DESC LIMIT 1",
        )
        .bind(file_path)
        .bind(language)
        .bind(subtitle_type)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn latest_download_score(
        &self,
        file_path: &str,
        language: &str,
        subtitle_type: SubtitleKind,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT score FROM subtitle_downloads
             WHERE file_path = ? AND language = ? AND subtitle_type = ?
             ORDER BY downloaded_at DESC LIMIT 1",
        )
        .bind(file_path)
        .bind(language)
        .bind(subtitle_type.to_string())
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_downloads(&self, limit: i64) -> Result<Vec<SubtitleDownload>, sqlx::Error> {
        sqlx::query_as::<_, SubtitleDownload>(
            "SELECT * FROM subtitle_downloads ORDER BY downloaded_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn blacklist_add(
        &self,
        provider: &str,
        external_id: &str,
        reason: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT OR IGNORE INTO blacklist (provider, subtitle_external_id, reason, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(provider)
        .bind(external_id)
        .bind(reason)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn blacklist_contains(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM blacklist WHERE provider = ? AND subtitle_external_id = ?",
        )
        .bind(provider)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn blacklist_list(&self) -> Result<Vec<BlacklistEntry>, sqlx::Error> {
        sqlx::query_as::<_, BlacklistEntry>("SELECT * FROM blacklist ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
    }
}

// Metadata cache

impl Db {
    pub async fn metadata_cache_get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT response_body, expires_at FROM metadata_cache WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((body, expires_at)) if expires_at > now_secs() => Ok(Some(body)),
            _ => Ok(None),
        }
    }

    pub async fn metadata_cache_set(
        &self,
        key: &str,
        provider: &str,
        body: &str,
        ttl_seconds: i64,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let now = now_secs();
        sqlx::query(
            "INSERT INTO metadata_cache (cache_key, provider, response_body, cached_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (cache_key) DO UPDATE SET
                provider = excluded.provider,
                response_body = excluded.response_body,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(provider)
        .bind(body)
        .bind(now)
        .bind(now + ttl_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn metadata_cache_evict_expired(&self) -> Result<u64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM metadata_cache WHERE expires_at <= ?")
            .bind(now_secs())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// Translation memory

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TmEntry {
    pub id: i64,
    pub source_lang: String,
    pub target_lang: String,
    pub normalized_source_text: String,
    pub text_hash: String,
    pub translated_text: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct TmStats {
    pub entries: i64,
    pub language_pairs: i64,
}

impl Db {
    pub async fn tm_lookup_exact(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
    ) -> Result<Option<TmEntry>, sqlx::Error> {
        sqlx::query_as::<_, TmEntry>(
            "SELECT * FROM translation_memory
             WHERE source_lang = ? AND target_lang = ? AND text_hash = ?",
        )
        .bind(source_lang)
        .bind(target_lang)
        .bind(text_hash)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn tm_candidates(
        &self,
        source_lang: &str,
        target_lang: &str,
        limit: i64,
    ) -> Result<Vec<TmEntry>, sqlx::Error> {
        sqlx::query_as::<_, TmEntry>(
            "SELECT * FROM translation_memory
             WHERE source_lang = ? AND target_lang = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(source_lang)
        .bind(target_lang)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn tm_upsert(
        &self,
        source_lang: &str,
        target_lang: &str,
        normalized_source_text: &str,
        text_hash: &str,
        translated_text: &str,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO translation_memory
             (source_lang, target_lang, normalized_source_text, text_hash, translated_text, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (source_lang, target_lang, text_hash) DO UPDATE SET
                translated_text = excluded.translated_text",
        )
        .bind(source_lang)
        .bind(target_lang)
        .bind(normalized_source_text)
        .bind(text_hash)
        .bind(translated_text)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tm_stats(&self) -> Result<TmStats, sqlx::Error> {
        sqlx::query_as::<_, TmStats>(
            "SELECT COUNT(*) AS entries,
                    COUNT(DISTINCT source_lang || ':' || target_lang) AS language_pairs
             FROM translation_memory",
        )
        .fetch_one(&self.pool)
        .await
    }

    pub async fn tm_clear(&self) -> Result<u64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM translation_memory")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// Standalone media

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StandaloneSeries {
    pub id: i64,
    pub title: String,
    pub normalized_title: String,
    pub year: Option<i64>,
    pub metadata_provider: Option<String>,
    pub metadata_id: Option<String>,
    pub is_anime: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StandaloneMovie {
    pub id: i64,
    pub title: String,
    pub normalized_title: String,
    pub year: Option<i64>,
    pub file_path: String,
    pub metadata_provider: Option<String>,
    pub metadata_id: Option<String>,
    pub is_anime: bool,
    pub created_at: i64,
}

impl Db {
    pub async fn upsert_standalone_series(
        &self,
        title: &str,
        normalized_title: &str,
        year: Option<i64>,
        metadata_provider: Option<&str>,
        metadata_id: Option<&str>,
        is_anime: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO standalone_series
             (title, normalized_title, year, metadata_provider, metadata_id, is_anime, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (normalized_title, year) DO UPDATE SET
                title = excluded.title,
                metadata_provider = COALESCE(excluded.metadata_provider, standalone_series.metadata_provider),
                metadata_id = COALESCE(excluded.metadata_id, standalone_series.metadata_id),
                is_anime = excluded.is_anime
             RETURNING id",
        )
        .bind(title)
        .bind(normalized_title)
        .bind(year)
        .bind(metadata_provider)
        .bind(metadata_id)
        .bind(is_anime)
        .bind(now_secs())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn upsert_standalone_movie(
        &self,
        title: &str,
        normalized_title: &str,
        year: Option<i64>,
        file_path: &str,
        metadata_provider: Option<&str>,
        metadata_id: Option<&str>,
        is_anime: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO standalone_movies
             (title, normalized_title, year, file_path, metadata_provider, metadata_id, is_anime, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (file_path) DO UPDATE SET
                title = excluded.title,
                metadata_provider = COALESCE(excluded.metadata_provider, standalone_movies.metadata_provider),
                metadata_id = COALESCE(excluded.metadata_id, standalone_movies.metadata_id),
                is_anime = excluded.is_anime
             RETURNING id",
        )
        .bind(title)
        .bind(normalized_title)
        .bind(year)
        .bind(file_path)
        .bind(metadata_provider)
        .bind(metadata_id)
        .bind(is_anime)
        .bind(now_secs())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_standalone_series(&self) -> Result<Vec<StandaloneSeries>, sqlx::Error> {
        sqlx::query_as::<_, StandaloneSeries>("SELECT * FROM standalone_series ORDER BY title")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn list_standalone_movies(&self) -> Result<Vec<StandaloneMovie>, sqlx::Error> {
        sqlx::query_as::<_, StandaloneMovie>("SELECT * FROM standalone_movies ORDER BY title")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn find_standalone_series(
        &self,
        normalized_title: &str,
        year: Option<i64>,
    ) -> Result<Option<StandaloneSeries>, sqlx::Error> {
        sqlx::query_as::<_, StandaloneSeries>(
            "SELECT * FROM standalone_series WHERE normalized_title = ? AND year IS ?",
        )
        .bind(normalized_title)
        .bind(year)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn new_item(path: &str, language: &str, kind: SubtitleKind) -> NewWantedItem {
        NewWantedItem {
            item_kind: ItemKind::Episode,
            source_ref: "library_series:1".into(),
            file_path: path.into(),
            title: "Show".into(),
            season: Some(1),
            episode: Some(2),
            year: None,
            target_language: language.into(),
            subtitle_type: kind,
            missing_languages: vec![language.into()],
            existing_subtitle_path: None,
            existing_score: None,
            upgrade_candidate: false,
            instance_name: "library".into(),
            profile_id: 1,
        }
    }

    #[tokio::test]
    async fn migration_sets_schema_version() {
        let db = test_db().await;
        assert_eq!(db.schema_version().await.unwrap(), Db::latest_schema_version());
        assert!(!db.needs_migration().await.unwrap());
    }

    #[tokio::test]
    async fn wanted_upsert_is_idempotent_per_fingerprint() {
        let db = test_db().await;
        let a = db
            .upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Full))
            .await
            .unwrap();
        let b = db
            .upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Full))
            .await
            .unwrap();
        assert_eq!(a, b);
        // full and forced items coexist for the same file
        let c = db
            .upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Forced))
            .await
            .unwrap();
        assert_ne!(a, c);
        let summary = db.wanted_summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.wanted, 2);
    }

    #[tokio::test]
    async fn transition_claims_exactly_once() {
        let db = test_db().await;
        let id = db
            .upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Full))
            .await
            .unwrap();
        assert!(db
            .transition_status(id, &[WantedStatus::Wanted], WantedStatus::Searching)
            .await
            .unwrap());
        // second claim loses
        assert!(!db
            .transition_status(id, &[WantedStatus::Wanted], WantedStatus::Searching)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn upsert_does_not_reset_status() {
        let db = test_db().await;
        let id = db
            .upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Full))
            .await
            .unwrap();
        db.transition_status(id, &[WantedStatus::Wanted], WantedStatus::Downloaded)
            .await
            .unwrap();
        db.upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Full))
            .await
            .unwrap();
        let item = db.get_wanted(id).await.unwrap();
        assert_eq!(item.status, WantedStatus::Downloaded);
    }

    #[tokio::test]
    async fn tm_round_trip() {
        let db = test_db().await;
        db.tm_upsert("en", "de", "hello there", "abc123", "hallo du")
            .await
            .unwrap();
        let hit = db.tm_lookup_exact("en", "de", "abc123").await.unwrap();
        assert_eq!(hit.unwrap().translated_text, "hallo du");
        assert!(db.tm_lookup_exact("en", "fr", "abc123").await.unwrap().is_none());
        let stats = db.tm_stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.language_pairs, 1);
    }

    #[tokio::test]
    async fn metadata_cache_honors_ttl() {
        let db = test_db().await;
        db.metadata_cache_set("key", "tmdb", "{}", 60).await.unwrap();
        assert!(db.metadata_cache_get("key").await.unwrap().is_some());
        db.metadata_cache_set("old", "tmdb", "{}", -10).await.unwrap();
        assert!(db.metadata_cache_get("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blacklist_round_trip() {
        let db = test_db().await;
        db.blacklist_add("opensubtitles", "123", Some("bad sync"))
            .await
            .unwrap();
        assert!(db.blacklist_contains("opensubtitles", "123").await.unwrap());
        assert!(!db.blacklist_contains("opensubtitles", "999").await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_cleanup_skips_standalone() {
        let db = test_db().await;
        let mut standalone = new_item("/w/b.mkv", "en", SubtitleKind::Full);
        standalone.instance_name = "standalone".into();
        db.upsert_wanted_item(standalone).await.unwrap();
        db.upsert_wanted_item(new_item("/m/a.mkv", "en", SubtitleKind::Full))
            .await
            .unwrap();

        let removed = db
            .cleanup_wanted_missing_files("library", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let summary = db.wanted_summary().await.unwrap();
        assert_eq!(summary.total, 1);
    }
}
