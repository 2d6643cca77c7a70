use serde::Serialize;
use sqlx::FromRow;

use crate::utils::now_secs;

use super::Db;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SubtitleHealthResult {
    pub id: i64,
    pub file_path: String,
    pub score: i64,
    /// JSON-encoded issue list.
    pub issues: String,
    pub checked_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SubtitleContentHash {
    pub file_path: String,
    pub content_hash: String,
    pub size: i64,
    pub format: String,
    pub language: Option<String>,
    pub line_count: i64,
    pub scanned_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub content_hash: String,
    pub files: Vec<SubtitleContentHash>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CleanupRule {
    pub id: i64,
    pub name: String,
    pub rule_type: String,
    pub params: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CleanupHistoryEntry {
    pub id: i64,
    pub action: String,
    pub details: String,
    pub files_removed: i64,
    pub run_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FilterPreset {
    pub id: i64,
    pub name: String,
    pub scope: String,
    pub condition_tree: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct CleanupStats {
    pub hashed_files: i64,
    pub duplicate_groups: i64,
    pub duplicate_files: i64,
    pub cleanup_runs: i64,
}

impl Db {
    pub async fn health_insert(
        &self,
        file_path: &str,
        score: i64,
        issues_json: &str,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO subtitle_health_results (file_path, score, issues, checked_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(file_path)
        .bind(score)
        .bind(issues_json)
        .bind(now_secs())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn health_latest(
        &self,
        file_path: &str,
    ) -> Result<Option<SubtitleHealthResult>, sqlx::Error> {
        sqlx::query_as::<_, SubtitleHealthResult>(
            "SELECT * FROM subtitle_health_results
             WHERE file_path = ? ORDER BY checked_at DESC, id DESC LIMIT 1",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await
    }

    /// Every stored run for a file, oldest first. Backs the trend view.
    pub async fn health_history(
        &self,
        file_path: &str,
    ) -> Result<Vec<SubtitleHealthResult>, sqlx::Error> {
        sqlx::query_as::<_, SubtitleHealthResult>(
            "SELECT * FROM subtitle_health_results WHERE file_path = ? ORDER BY checked_at ASC, id ASC",
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn hash_upsert(
        &self,
        file_path: &str,
        content_hash: &str,
        size: i64,
        format: &str,
        language: Option<&str>,
        line_count: i64,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO subtitle_content_hashes
             (file_path, content_hash, size, format, language, line_count, scanned_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                format = excluded.format,
                language = excluded.language,
                line_count = excluded.line_count,
                scanned_at = excluded.scanned_at",
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(size)
        .bind(format)
        .bind(language)
        .bind(line_count)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn hash_remove(&self, file_path: &str) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM subtitle_content_hashes WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn hash_get(
        &self,
        file_path: &str,
    ) -> Result<Option<SubtitleContentHash>, sqlx::Error> {
        sqlx::query_as::<_, SubtitleContentHash>(
            "SELECT * FROM subtitle_content_hashes WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, sqlx::Error> {
        let rows = sqlx::query_as::<_, SubtitleContentHash>(
            "SELECT * FROM subtitle_content_hashes
             WHERE content_hash IN (
                SELECT content_hash FROM subtitle_content_hashes
                GROUP BY content_hash HAVING COUNT(*) >= 2
             )
             ORDER BY content_hash, file_path",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut groups: Vec<DuplicateGroup> = Vec::new();
        for row in rows {
            match groups.last_mut() {
                Some(group) if group.content_hash == row.content_hash => group.files.push(row),
                _ => groups.push(DuplicateGroup {
                    content_hash: row.content_hash.clone(),
                    files: vec![row],
                }),
            }
        }
        Ok(groups)
    }

    pub async fn cleanup_record(
        &self,
        action: &str,
        details: &str,
        files_removed: i64,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO cleanup_history (action, details, files_removed, run_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(action)
        .bind(details)
        .bind(files_removed)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_cleanup_history(
        &self,
        limit: i64,
    ) -> Result<Vec<CleanupHistoryEntry>, sqlx::Error> {
        sqlx::query_as::<_, CleanupHistoryEntry>(
            "SELECT * FROM cleanup_history ORDER BY run_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_cleanup_rules(&self) -> Result<Vec<CleanupRule>, sqlx::Error> {
        sqlx::query_as::<_, CleanupRule>("SELECT * FROM cleanup_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn upsert_cleanup_rule(
        &self,
        name: &str,
        rule_type: &str,
        params: &str,
        enabled: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO cleanup_rules (name, rule_type, params, enabled)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET
                rule_type = excluded.rule_type,
                params = excluded.params,
                enabled = excluded.enabled
             RETURNING id",
        )
        .bind(name)
        .bind(rule_type)
        .bind(params)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn cleanup_stats(&self) -> Result<CleanupStats, sqlx::Error> {
        sqlx::query_as::<_, CleanupStats>(
            "SELECT
                (SELECT COUNT(*) FROM subtitle_content_hashes) AS hashed_files,
                (SELECT COUNT(*) FROM (
                    SELECT content_hash FROM subtitle_content_hashes
                    GROUP BY content_hash HAVING COUNT(*) >= 2
                )) AS duplicate_groups,
                (SELECT COUNT(*) FROM subtitle_content_hashes WHERE content_hash IN (
                    SELECT content_hash FROM subtitle_content_hashes
                    GROUP BY content_hash HAVING COUNT(*) >= 2
                )) AS duplicate_files,
                (SELECT COUNT(*) FROM cleanup_history) AS cleanup_runs",
        )
        .fetch_one(&self.pool)
        .await
    }

    pub async fn upsert_filter_preset(
        &self,
        id: Option<i64>,
        name: &str,
        scope: &str,
        condition_tree: &str,
        is_default: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        match id {
            Some(id) => {
                sqlx::query(
                    "UPDATE filter_presets
                     SET name = ?, scope = ?, condition_tree = ?, is_default = ?
                     WHERE id = ?",
                )
                .bind(name)
                .bind(scope)
                .bind(condition_tree)
                .bind(is_default)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO filter_presets (name, scope, condition_tree, is_default)
                     VALUES (?, ?, ?, ?) RETURNING id",
                )
                .bind(name)
                .bind(scope)
                .bind(condition_tree)
                .bind(is_default)
                .fetch_one(&self.pool)
                .await
            }
        }
    }

    pub async fn list_filter_presets(&self) -> Result<Vec<FilterPreset>, sqlx::Error> {
        sqlx::query_as::<_, FilterPreset>("SELECT * FROM filter_presets ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_filter_preset(&self, id: i64) -> Result<FilterPreset, sqlx::Error> {
        sqlx::query_as::<_, FilterPreset>("SELECT * FROM filter_presets WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn delete_filter_preset(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM filter_presets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Db;

    async fn test_db() -> Db {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn duplicate_groups_require_two_files() {
        let db = test_db().await;
        db.hash_upsert("/s/a.srt", "h1", 10, "srt", Some("en"), 5)
            .await
            .unwrap();
        db.hash_upsert("/s/b.srt", "h1", 10, "srt", Some("en"), 5)
            .await
            .unwrap();
        db.hash_upsert("/s/c.srt", "h2", 11, "srt", None, 6)
            .await
            .unwrap();

        let groups = db.duplicate_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].content_hash, "h1");
        assert_eq!(groups[0].files.len(), 2);

        let stats = db.cleanup_stats().await.unwrap();
        assert_eq!(stats.hashed_files, 3);
        assert_eq!(stats.duplicate_groups, 1);
        assert_eq!(stats.duplicate_files, 2);
    }

    #[tokio::test]
    async fn health_results_are_append_only() {
        let db = test_db().await;
        db.health_insert("/s/a.srt", 90, "[]").await.unwrap();
        db.health_insert("/s/a.srt", 70, r#"[{"check":"timing_overlaps"}]"#)
            .await
            .unwrap();
        let history = db.health_history("/s/a.srt").await.unwrap();
        assert_eq!(history.len(), 2);
        let latest = db.health_latest("/s/a.srt").await.unwrap().unwrap();
        assert_eq!(latest.score, 70);
    }
}
