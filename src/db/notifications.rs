use serde::Serialize;
use sqlx::FromRow;

use crate::utils::now_secs;

use super::Db;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HookDefinition {
    pub id: i64,
    pub name: String,
    /// JSON array of event names; empty array subscribes to everything.
    pub event_filter: String,
    pub command: String,
    pub enabled: bool,
    pub last_exit_code: Option<i64>,
    pub last_run_at: Option<i64>,
}

impl HookDefinition {
    pub fn subscribes_to(&self, event_name: &str) -> bool {
        let events: Vec<String> = serde_json::from_str(&self.event_filter).unwrap_or_default();
        events.is_empty() || events.iter().any(|e| e == event_name)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebhookDefinition {
    pub id: i64,
    pub name: String,
    pub event_filter: String,
    pub url: String,
    pub template: Option<String>,
    pub enabled: bool,
    pub last_status: Option<i64>,
    pub last_run_at: Option<i64>,
}

impl WebhookDefinition {
    pub fn subscribes_to(&self, event_name: &str) -> bool {
        let events: Vec<String> = serde_json::from_str(&self.event_filter).unwrap_or_default();
        events.is_empty() || events.iter().any(|e| e == event_name)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HookLog {
    pub id: i64,
    pub hook_id: i64,
    pub event_name: String,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub executed_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NotificationTemplate {
    pub id: i64,
    pub service: Option<String>,
    pub event_name: Option<String>,
    pub title_template: String,
    pub body_template: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QuietHoursRule {
    pub id: i64,
    pub name: String,
    /// Minutes since local midnight. `start > end` wraps across midnight.
    pub start_minute: i64,
    pub end_minute: i64,
    pub days_of_week: String,
    pub exception_events: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NotificationHistoryEntry {
    pub id: i64,
    pub service: String,
    pub event_name: String,
    pub title: String,
    pub body: String,
    pub suppressed: bool,
    pub error: Option<String>,
    pub created_at: i64,
}

impl Db {
    pub async fn upsert_hook(
        &self,
        id: Option<i64>,
        name: &str,
        event_filter: &str,
        command: &str,
        enabled: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        match id {
            Some(id) => {
                sqlx::query(
                    "UPDATE hooks SET name = ?, event_filter = ?, command = ?, enabled = ? WHERE id = ?",
                )
                .bind(name)
                .bind(event_filter)
                .bind(command)
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO hooks (name, event_filter, command, enabled)
                     VALUES (?, ?, ?, ?) RETURNING id",
                )
                .bind(name)
                .bind(event_filter)
                .bind(command)
                .bind(enabled)
                .fetch_one(&self.pool)
                .await
            }
        }
    }

    pub async fn list_hooks(&self) -> Result<Vec<HookDefinition>, sqlx::Error> {
        sqlx::query_as::<_, HookDefinition>("SELECT * FROM hooks ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_hook(&self, id: i64) -> Result<HookDefinition, sqlx::Error> {
        sqlx::query_as::<_, HookDefinition>("SELECT * FROM hooks WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn delete_hook(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM hooks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_hook_run(
        &self,
        hook_id: i64,
        event_name: &str,
        exit_code: Option<i64>,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let now = now_secs();
        sqlx::query(
            "INSERT INTO hook_logs (hook_id, event_name, exit_code, stdout, stderr, executed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(hook_id)
        .bind(event_name)
        .bind(exit_code)
        .bind(stdout)
        .bind(stderr)
        .bind(now)
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE hooks SET last_exit_code = ?, last_run_at = ? WHERE id = ?")
            .bind(exit_code)
            .bind(now)
            .bind(hook_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_hook_logs(&self, hook_id: Option<i64>) -> Result<Vec<HookLog>, sqlx::Error> {
        match hook_id {
            Some(id) => {
                sqlx::query_as::<_, HookLog>(
                    "SELECT * FROM hook_logs WHERE hook_id = ? ORDER BY executed_at DESC LIMIT 200",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, HookLog>(
                    "SELECT * FROM hook_logs ORDER BY executed_at DESC LIMIT 200",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
    }

    pub async fn clear_hook_logs(&self) -> Result<u64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM hook_logs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_webhook(
        &self,
        id: Option<i64>,
        name: &str,
        event_filter: &str,
        url: &str,
        template: Option<&str>,
        enabled: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        match id {
            Some(id) => {
                sqlx::query(
                    "UPDATE webhooks SET name = ?, event_filter = ?, url = ?, template = ?, enabled = ? WHERE id = ?",
                )
                .bind(name)
                .bind(event_filter)
                .bind(url)
                .bind(template)
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO webhooks (name, event_filter, url, template, enabled)
                     VALUES (?, ?, ?, ?, ?) RETURNING id",
                )
                .bind(name)
                .bind(event_filter)
                .bind(url)
                .bind(template)
                .bind(enabled)
                .fetch_one(&self.pool)
                .await
            }
        }
    }

    pub async fn list_webhooks(&self) -> Result<Vec<WebhookDefinition>, sqlx::Error> {
        sqlx::query_as::<_, WebhookDefinition>("SELECT * FROM webhooks ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn delete_webhook(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_webhook_run(&self, id: i64, status: Option<i64>) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE webhooks SET last_status = ?, last_run_at = ? WHERE id = ?")
            .bind(status)
            .bind(now_secs())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_notification_template(
        &self,
        id: Option<i64>,
        service: Option<&str>,
        event_name: Option<&str>,
        title_template: &str,
        body_template: &str,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        match id {
            Some(id) => {
                sqlx::query(
                    "UPDATE notification_templates
                     SET service = ?, event_name = ?, title_template = ?, body_template = ?
                     WHERE id = ?",
                )
                .bind(service)
                .bind(event_name)
                .bind(title_template)
                .bind(body_template)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO notification_templates
                     (service, event_name, title_template, body_template, created_at)
                     VALUES (?, ?, ?, ?, ?) RETURNING id",
                )
                .bind(service)
                .bind(event_name)
                .bind(title_template)
                .bind(body_template)
                .bind(now_secs())
                .fetch_one(&self.pool)
                .await
            }
        }
    }

    pub async fn list_notification_templates(
        &self,
    ) -> Result<Vec<NotificationTemplate>, sqlx::Error> {
        sqlx::query_as::<_, NotificationTemplate>(
            "SELECT * FROM notification_templates ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_notification_template(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM notification_templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Template resolution chain: `(service, event)` -> `event` -> default.
    pub async fn find_notification_template(
        &self,
        service: &str,
        event_name: &str,
    ) -> Result<Option<NotificationTemplate>, sqlx::Error> {
        sqlx::query_as::<_, NotificationTemplate>(
            "SELECT * FROM notification_templates
             WHERE (service = ? AND event_name = ?)
                OR (service IS NULL AND event_name = ?)
                OR (service IS NULL AND event_name IS NULL)
             ORDER BY (service IS NOT NULL) DESC, (event_name IS NOT NULL) DESC
             LIMIT 1",
        )
        .bind(service)
        .bind(event_name)
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn upsert_quiet_hours(
        &self,
        id: Option<i64>,
        name: &str,
        start_minute: i64,
        end_minute: i64,
        days_of_week: &str,
        exception_events: &str,
        enabled: bool,
    ) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        match id {
            Some(id) => {
                sqlx::query(
                    "UPDATE quiet_hours
                     SET name = ?, start_minute = ?, end_minute = ?, days_of_week = ?,
                         exception_events = ?, enabled = ?
                     WHERE id = ?",
                )
                .bind(name)
                .bind(start_minute)
                .bind(end_minute)
                .bind(days_of_week)
                .bind(exception_events)
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO quiet_hours
                     (name, start_minute, end_minute, days_of_week, exception_events, enabled)
                     VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
                )
                .bind(name)
                .bind(start_minute)
                .bind(end_minute)
                .bind(days_of_week)
                .bind(exception_events)
                .bind(enabled)
                .fetch_one(&self.pool)
                .await
            }
        }
    }

    pub async fn list_quiet_hours(&self) -> Result<Vec<QuietHoursRule>, sqlx::Error> {
        sqlx::query_as::<_, QuietHoursRule>("SELECT * FROM quiet_hours ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn delete_quiet_hours(&self, id: i64) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM quiet_hours WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_notification(
        &self,
        service: &str,
        event_name: &str,
        title: &str,
        body: &str,
        suppressed: bool,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO notification_history
             (service, event_name, title, body, suppressed, error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(service)
        .bind(event_name)
        .bind(title)
        .bind(body)
        .bind(suppressed)
        .bind(error)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_notification_history(
        &self,
        limit: i64,
    ) -> Result<Vec<NotificationHistoryEntry>, sqlx::Error> {
        sqlx::query_as::<_, NotificationHistoryEntry>(
            "SELECT * FROM notification_history ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
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
    async fn template_fallback_chain() {
        let db = test_db().await;
        db.upsert_notification_template(None, None, None, "default {event}", "d")
            .await
            .unwrap();
        db.upsert_notification_template(None, None, Some("subtitle_downloaded"), "event {event}", "e")
            .await
            .unwrap();
        db.upsert_notification_template(
            None,
            Some("discord"),
            Some("subtitle_downloaded"),
            "service {event}",
            "s",
        )
        .await
        .unwrap();

        let t = db
            .find_notification_template("discord", "subtitle_downloaded")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.title_template, "service {event}");

        let t = db
            .find_notification_template("gotify", "subtitle_downloaded")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.title_template, "event {event}");

        let t = db
            .find_notification_template("gotify", "cleanup_run")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.title_template, "default {event}");
    }

    #[tokio::test]
    async fn hook_filter_matching() {
        let db = test_db().await;
        let id = db
            .upsert_hook(None, "all", "[]", "echo hi", true)
            .await
            .unwrap();
        let hook = db.get_hook(id).await.unwrap();
        assert!(hook.subscribes_to("anything"));

        let id = db
            .upsert_hook(None, "one", r#"["search_failed"]"#, "echo hi", true)
            .await
            .unwrap();
        let hook = db.get_hook(id).await.unwrap();
        assert!(hook.subscribes_to("search_failed"));
        assert!(!hook.subscribes_to("subtitle_downloaded"));
    }
}
