use std::{collections::HashSet, path::PathBuf};

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    app_state::{AppError, AppState},
    config::{self, CONFIG},
    db::{WantedFilters, WantedStatus},
    events::Event,
    filters::{parse_and_compile, PresetScope},
    health::dedup::GroupDecision,
    subtitles::SubtitleKind,
    tracing::LogChannel,
};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/wanted", get(list_wanted))
        .route("/wanted/batch-action", post(wanted_batch_action))
        .route("/wanted/refresh", post(trigger_scan))
        .route("/wanted/search-all", post(trigger_search))
        .route("/search", get(search_suggestions))
        .route("/history", get(download_history))
        .route("/profiles", get(list_profiles))
        .route("/profiles", post(upsert_profile))
        .route("/profiles/{id}", delete(delete_profile))
        .route("/profiles/assign", post(assign_profile))
        .route("/filter-presets", get(list_presets))
        .route("/filter-presets", post(create_preset))
        .route("/filter-presets/{id}", put(update_preset))
        .route("/filter-presets/{id}", delete(delete_preset))
        .route("/translate", post(translate_file))
        .route("/translation-memory/stats", get(tm_stats))
        .route("/translation-memory/cache", delete(tm_clear))
        .route("/health", get(health_shallow))
        .route("/health/detailed", get(health_detailed))
        .route("/subtitles/health", post(check_subtitle_health))
        .route("/subtitles/autofix", post(autofix_subtitle))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{name}/run", post(run_task))
        .route("/cleanup/stats", get(cleanup_stats))
        .route("/cleanup/dedup-scan", post(dedup_scan))
        .route("/cleanup/history", get(cleanup_history))
        .route("/duplicates", get(duplicate_groups))
        .route("/duplicates/delete", post(delete_duplicates))
        .route("/orphans", get(list_orphans))
        .route("/blacklist", get(list_blacklist))
        .route("/notifications/templates", get(list_templates))
        .route("/notifications/templates", post(upsert_template))
        .route("/notifications/templates/{id}", delete(delete_template))
        .route("/notifications/quiet-hours", get(list_quiet_hours))
        .route("/notifications/quiet-hours", post(upsert_quiet_hours))
        .route("/notifications/quiet-hours/{id}", delete(delete_quiet_hours))
        .route("/notifications/history", get(notification_history))
        .route("/hooks", get(list_hooks))
        .route("/hooks", post(upsert_hook))
        .route("/hooks/{id}", delete(delete_hook))
        .route("/hooks/{id}/test", post(test_hook))
        .route("/hooks/logs", get(hook_logs))
        .route("/hooks/logs", delete(clear_hook_logs))
        .route("/webhooks", get(list_webhooks))
        .route("/webhooks", post(upsert_webhook))
        .route("/webhooks/{id}", delete(delete_webhook))
        .route("/configuration", get(get_configuration))
        .route("/configuration", axum::routing::patch(patch_configuration))
        .route("/system/status", get(system_status))
        .route("/log", get(LogChannel::into_sse_stream))
}

// Wanted

#[derive(Debug, Deserialize)]
struct WantedQuery {
    item_type: Option<crate::db::ItemKind>,
    status: Option<WantedStatus>,
    subtitle_type: Option<String>,
    search: Option<String>,
    sort_by: Option<String>,
    sort_dir: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    preset_id: Option<i64>,
}

async fn list_wanted(
    State(app): State<AppState>,
    Query(query): Query<WantedQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut filters = WantedFilters {
        item_type: query.item_type,
        status: query.status,
        subtitle_type: query.subtitle_type,
        search: query.search,
        sort_by: query.sort_by,
        sort_dir: query.sort_dir,
        limit: query.limit,
        offset: query.offset,
        preset_clause: None,
    };
    if let Some(preset_id) = query.preset_id {
        let preset = app.db.get_filter_preset(preset_id).await?;
        let scope = match preset.scope.as_str() {
            "wanted" => PresetScope::Wanted,
            other => {
                return Err(AppError::bad_request(format!(
                    "preset scope {other} cannot filter wanted items"
                )))
            }
        };
        filters.preset_clause = Some(parse_and_compile(scope, &preset.condition_tree)?);
    }
    let items = app.db.list_wanted(&filters).await?;
    let summary = app.db.wanted_summary().await?;
    Ok(Json(json!({ "items": items, "summary": summary })))
}

#[derive(Debug, Deserialize)]
struct BatchActionBody {
    action: String,
    ids: Vec<i64>,
}

const BATCH_ACTION_LIMIT: usize = 500;

async fn wanted_batch_action(
    State(app): State<AppState>,
    Json(body): Json<BatchActionBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.ids.len() > BATCH_ACTION_LIMIT {
        return Err(AppError::bad_request(format!(
            "batch limited to {BATCH_ACTION_LIMIT} items"
        )));
    }
    let mut affected = 0;
    let mut exported = Vec::new();
    for id in &body.ids {
        let item = match app.db.get_wanted(*id).await {
            Ok(item) => item,
            Err(sqlx::Error::RowNotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        match body.action.as_str() {
            "ignore" => {
                if app
                    .db
                    .transition_status(
                        item.id,
                        &[
                            WantedStatus::Wanted,
                            WantedStatus::Failed,
                            WantedStatus::Searching,
                        ],
                        WantedStatus::Ignored,
                    )
                    .await?
                {
                    affected += 1;
                }
            }
            "unignore" => {
                if app
                    .db
                    .transition_status(item.id, &[WantedStatus::Ignored], WantedStatus::Wanted)
                    .await?
                {
                    affected += 1;
                }
            }
            "blacklist" => {
                // blacklist the release behind the latest download and queue
                // the item for a fresh search
                if let Some(download) = app
                    .db
                    .latest_download(&item.file_path, &item.target_language, &item.subtitle_type)
                    .await?
                {
                    if let Some(external_id) = download.external_id {
                        app.db
                            .blacklist_add(
                                &download.provider,
                                &external_id,
                                Some("user batch action"),
                            )
                            .await?;
                    }
                }
                let _ = app
                    .db
                    .transition_status(
                        item.id,
                        &[
                            WantedStatus::Downloaded,
                            WantedStatus::Translated,
                            WantedStatus::Failed,
                        ],
                        WantedStatus::Wanted,
                    )
                    .await?;
                affected += 1;
            }
            "delete" => {
                app.db.delete_wanted(item.id).await?;
                affected += 1;
            }
            "export" => {
                exported.push(item);
                affected += 1;
            }
            other => return Err(AppError::bad_request(format!("unknown action: {other}"))),
        }
    }
    if body.action == "export" {
        return Ok(Json(json!({ "affected": affected, "items": exported })));
    }
    Ok(Json(json!({ "affected": affected })))
}

async fn trigger_scan(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    app.scheduler.trigger("wanted_scan")?;
    Ok(Json(json!({ "triggered": "wanted_scan" })))
}

async fn trigger_search(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    app.scheduler.trigger("wanted_search")?;
    Ok(Json(json!({ "triggered": "wanted_search" })))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search_suggestions(
    State(app): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<String>>, AppError> {
    if query.q.chars().count() < 2 {
        return Err(AppError::bad_request("query must be at least 2 characters"));
    }
    let needle = query.q.to_lowercase();
    let mut suggestions: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |s: String| {
        if s.to_lowercase().contains(&needle) && seen.insert(s.to_lowercase()) {
            suggestions.push(s);
        }
    };
    for series in app.db.list_standalone_series().await? {
        push(series.title);
    }
    for movie in app.db.list_standalone_movies().await? {
        push(movie.title);
    }
    let items = app
        .db
        .list_wanted(&WantedFilters {
            search: Some(query.q.clone()),
            limit: Some(50),
            ..Default::default()
        })
        .await?;
    for item in items {
        push(item.title);
    }
    suggestions.truncate(20);
    Ok(Json(suggestions))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn download_history(
    State(app): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<crate::db::SubtitleDownload>>, AppError> {
    Ok(Json(
        app.db
            .list_downloads(query.limit.unwrap_or(100).clamp(1, 500))
            .await?,
    ))
}

// Profiles

async fn list_profiles(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::DbLanguageProfile>>, AppError> {
    Ok(Json(app.db.list_profiles().await?))
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    name: String,
    languages: Vec<crate::profiles::ProfileLanguage>,
    acceptance_threshold: i64,
    upgrade_threshold: i64,
}

async fn upsert_profile(
    State(app): State<AppState>,
    Json(body): Json<ProfileBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let languages = serde_json::to_string(&body.languages)
        .map_err(|e| AppError::bad_request(format!("invalid languages: {e}")))?;
    let id = app
        .db
        .upsert_profile(
            &body.name,
            &languages,
            body.acceptance_threshold,
            body.upgrade_threshold,
        )
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_profile(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.db.delete_profile(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
struct AssignProfileBody {
    source_ref: String,
    profile_id: i64,
}

async fn assign_profile(
    State(app): State<AppState>,
    Json(body): Json<AssignProfileBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    // referenced profile must exist
    app.db.get_profile(body.profile_id).await?;
    app.db
        .assign_profile(&body.source_ref, body.profile_id)
        .await?;
    Ok(Json(json!({ "assigned": body.source_ref })))
}

// Filter presets

async fn list_presets(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::FilterPreset>>, AppError> {
    Ok(Json(app.db.list_filter_presets().await?))
}

#[derive(Debug, Deserialize)]
struct PresetBody {
    name: String,
    scope: PresetScope,
    condition_tree: serde_json::Value,
    #[serde(default)]
    is_default: bool,
}

fn validate_preset(body: &PresetBody) -> Result<String, AppError> {
    let condition_json = body.condition_tree.to_string();
    // compile once at the boundary so bad fields 400 here, not at query time
    parse_and_compile(body.scope, &condition_json)?;
    Ok(condition_json)
}

async fn create_preset(
    State(app): State<AppState>,
    Json(body): Json<PresetBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let condition_json = validate_preset(&body)?;
    let scope = serde_plain::to_string(&body.scope).unwrap();
    let id = app
        .db
        .upsert_filter_preset(None, &body.name, &scope, &condition_json, body.is_default)
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn update_preset(
    State(app): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<PresetBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let condition_json = validate_preset(&body)?;
    let scope = serde_plain::to_string(&body.scope).unwrap();
    app.db
        .upsert_filter_preset(Some(id), &body.name, &scope, &condition_json, body.is_default)
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_preset(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.db.delete_filter_preset(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// Translation

#[derive(Debug, Deserialize)]
struct TranslateBody {
    file_path: String,
    source_lang: String,
    target_lang: String,
    backend: Option<String>,
}

async fn translate_file(
    State(app): State<AppState>,
    Json(body): Json<TranslateBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let subtitle_path = PathBuf::from(&body.file_path);
    if !subtitle_path.is_file() {
        return Err(AppError::not_found("subtitle file does not exist"));
    }
    let job_id = Uuid::new_v4();
    let translator = app.translator;
    let events = app.events.clone();
    tokio::spawn(async move {
        // the sidecar names the video it belongs to
        let video_path = crate::subtitles::SubtitlePath::parse(&subtitle_path)
            .map(|p| subtitle_path.with_file_name(p.video_basename))
            .unwrap_or_else(|| subtitle_path.clone());
        events.publish(Event::TranslationStarted {
            file_path: subtitle_path.to_string_lossy().to_string(),
            source_lang: body.source_lang.clone(),
            target_lang: body.target_lang.clone(),
        });
        match translator
            .translate_file(
                &subtitle_path,
                &video_path,
                &body.source_lang,
                &body.target_lang,
                SubtitleKind::Full,
                body.backend.as_deref(),
            )
            .await
        {
            Ok((target, outcome)) if outcome.fully_translated() => {
                events.publish(Event::TranslationComplete {
                    file_path: target.to_string_lossy().to_string(),
                    target_lang: body.target_lang.clone(),
                    backend: outcome.backend_name,
                    lines: outcome.lines.len(),
                    duration_ms: outcome.duration_ms,
                });
            }
            Ok((_, outcome)) => {
                events.publish(Event::TranslationFailed {
                    file_path: subtitle_path.to_string_lossy().to_string(),
                    target_lang: body.target_lang.clone(),
                    reason: format!("{} batches failed", outcome.failed_batches),
                });
            }
            Err(e) => {
                events.publish(Event::TranslationFailed {
                    file_path: subtitle_path.to_string_lossy().to_string(),
                    target_lang: body.target_lang.clone(),
                    reason: e.message,
                });
            }
        }
    });
    Ok(Json(json!({ "job_id": job_id })))
}

async fn tm_stats(State(app): State<AppState>) -> Result<Json<crate::db::TmStats>, AppError> {
    Ok(Json(app.translation_memory.stats().await?))
}

async fn tm_clear(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let removed = app.translation_memory.clear().await?;
    Ok(Json(json!({ "removed": removed })))
}

// Health

async fn health_shallow() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct SubsystemHealth {
    healthy: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

async fn health_detailed(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut categories = serde_json::Map::new();

    let database = match app.db.schema_version().await {
        Ok(version) => SubsystemHealth {
            healthy: true,
            message: "ok".into(),
            details: Some(json!({ "schema_version": version })),
        },
        Err(e) => SubsystemHealth {
            healthy: false,
            message: e.to_string(),
            details: None,
        },
    };
    categories.insert("database".into(), serde_json::to_value(database).unwrap());

    let tasks = app.scheduler.statuses();
    let failing: Vec<_> = tasks
        .iter()
        .filter(|t| t.last_error.is_some())
        .map(|t| t.name)
        .collect();
    categories.insert(
        "scheduler".into(),
        serde_json::to_value(SubsystemHealth {
            healthy: failing.is_empty(),
            message: if failing.is_empty() {
                "ok".into()
            } else {
                format!("failing tasks: {}", failing.join(", "))
            },
            details: Some(json!({ "tasks": tasks.len() })),
        })
        .unwrap(),
    );

    let provider_names = app.providers.provider_names();
    let open = app.providers.breaker.open_providers();
    categories.insert(
        "providers".into(),
        serde_json::to_value(SubsystemHealth {
            healthy: !provider_names.is_empty() && open.is_empty(),
            message: if provider_names.is_empty() {
                "no providers registered".into()
            } else if open.is_empty() {
                "ok".into()
            } else {
                format!("open circuits: {}", open.join(", "))
            },
            details: Some(json!({ "registered": provider_names })),
        })
        .unwrap(),
    );

    let backends = app.translator.backend_names();
    let selected: config::TranslationBackendName = CONFIG.get_value();
    let backend_known = backends.iter().any(|b| *b == selected.0);
    categories.insert(
        "translation_backend".into(),
        serde_json::to_value(SubsystemHealth {
            healthy: backend_known,
            message: if backend_known {
                "ok".into()
            } else {
                format!("selected backend {} is not registered", selected.0)
            },
            details: Some(json!({ "registered": backends })),
        })
        .unwrap(),
    );

    let tm = match app.translation_memory.stats().await {
        Ok(stats) => SubsystemHealth {
            healthy: true,
            message: "ok".into(),
            details: Some(serde_json::to_value(stats).unwrap()),
        },
        Err(e) => SubsystemHealth {
            healthy: false,
            message: e.to_string(),
            details: None,
        },
    };
    categories.insert(
        "translation_memory".into(),
        serde_json::to_value(tm).unwrap(),
    );

    let folders: config::StandaloneFolders = CONFIG.get_value();
    let missing: Vec<String> = folders
        .0
        .iter()
        .filter(|p| !p.is_dir())
        .map(|p| p.display().to_string())
        .collect();
    categories.insert(
        "standalone_folders".into(),
        serde_json::to_value(SubsystemHealth {
            healthy: missing.is_empty(),
            message: if missing.is_empty() {
                "ok".into()
            } else {
                format!("missing folders: {}", missing.join(", "))
            },
            details: Some(json!({ "configured": folders.0.len() })),
        })
        .unwrap(),
    );

    for (name, count) in [
        ("hooks", app.db.list_hooks().await?.len()),
        ("webhooks", app.db.list_webhooks().await?.len()),
        (
            "notification_templates",
            app.db.list_notification_templates().await?.len(),
        ),
        ("quiet_hours", app.db.list_quiet_hours().await?.len()),
        ("filter_presets", app.db.list_filter_presets().await?.len()),
    ] {
        categories.insert(
            name.into(),
            serde_json::to_value(SubsystemHealth {
                healthy: true,
                message: "ok".into(),
                details: Some(json!({ "configured": count })),
            })
            .unwrap(),
        );
    }

    let healthy = categories
        .values()
        .all(|c| c["healthy"].as_bool().unwrap_or(false));
    Ok(Json(json!({ "healthy": healthy, "categories": categories })))
}

#[derive(Debug, Deserialize)]
struct SubtitlePathsBody {
    paths: Vec<PathBuf>,
}

async fn check_subtitle_health(
    State(app): State<AppState>,
    Json(body): Json<SubtitlePathsBody>,
) -> Result<Json<Vec<crate::health::FileHealthReport>>, AppError> {
    if body.paths.len() > crate::health::BATCH_LIMIT {
        return Err(AppError::bad_request(format!(
            "health batches are limited to {} files",
            crate::health::BATCH_LIMIT
        )));
    }
    Ok(Json(app.health.check_batch(&body.paths).await?))
}

async fn autofix_subtitle(
    State(app): State<AppState>,
    Json(body): Json<SubtitlePathsBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut results = serde_json::Map::new();
    for path in &body.paths {
        let applied = crate::health::autofix::fix_file(path, &app.events).await?;
        results.insert(
            path.to_string_lossy().to_string(),
            serde_json::to_value(applied).unwrap(),
        );
    }
    Ok(Json(serde_json::Value::Object(results)))
}

// Tasks

async fn list_tasks(State(app): State<AppState>) -> Json<Vec<crate::scheduler::TaskStatus>> {
    Json(app.scheduler.statuses())
}

async fn run_task(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.scheduler.trigger(&name)?;
    Ok(Json(json!({ "triggered": name })))
}

// Cleanup / dedup

async fn cleanup_stats(
    State(app): State<AppState>,
) -> Result<Json<crate::db::CleanupStats>, AppError> {
    Ok(Json(app.db.cleanup_stats().await?))
}

async fn dedup_scan(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let stats = app.dedup.scan().await?;
    Ok(Json(serde_json::to_value(stats).unwrap()))
}

async fn cleanup_history(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::CleanupHistoryEntry>>, AppError> {
    Ok(Json(app.db.list_cleanup_history(100).await?))
}

async fn duplicate_groups(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::DuplicateGroup>>, AppError> {
    Ok(Json(app.dedup.duplicate_groups().await?))
}

#[derive(Debug, Deserialize)]
struct DeleteDuplicatesBody {
    groups: Vec<GroupDecision>,
}

async fn delete_duplicates(
    State(app): State<AppState>,
    Json(body): Json<DeleteDuplicatesBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = app.dedup.delete_duplicates(&body.groups).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn list_orphans(State(app): State<AppState>) -> Result<Json<Vec<PathBuf>>, AppError> {
    Ok(Json(app.dedup.orphans().await?))
}

async fn list_blacklist(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::BlacklistEntry>>, AppError> {
    Ok(Json(app.db.blacklist_list().await?))
}

// Notifications

async fn list_templates(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::NotificationTemplate>>, AppError> {
    Ok(Json(app.db.list_notification_templates().await?))
}

#[derive(Debug, Deserialize)]
struct TemplateBody {
    id: Option<i64>,
    service: Option<String>,
    event_name: Option<String>,
    title_template: String,
    body_template: String,
}

async fn upsert_template(
    State(app): State<AppState>,
    Json(body): Json<TemplateBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = app
        .db
        .upsert_notification_template(
            body.id,
            body.service.as_deref(),
            body.event_name.as_deref(),
            &body.title_template,
            &body.body_template,
        )
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_template(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.db.delete_notification_template(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn list_quiet_hours(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::QuietHoursRule>>, AppError> {
    Ok(Json(app.db.list_quiet_hours().await?))
}

#[derive(Debug, Deserialize)]
struct QuietHoursBody {
    id: Option<i64>,
    name: String,
    start_minute: i64,
    end_minute: i64,
    days_of_week: Vec<i64>,
    #[serde(default)]
    exception_events: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn upsert_quiet_hours(
    State(app): State<AppState>,
    Json(body): Json<QuietHoursBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !(0..1440).contains(&body.start_minute) || !(0..=1440).contains(&body.end_minute) {
        return Err(AppError::bad_request("minutes must be within a day"));
    }
    if body.days_of_week.iter().any(|d| !(0..7).contains(d)) {
        return Err(AppError::bad_request(
            "days are 0 (Monday) through 6 (Sunday)",
        ));
    }
    let id = app
        .db
        .upsert_quiet_hours(
            body.id,
            &body.name,
            body.start_minute,
            body.end_minute,
            &serde_json::to_string(&body.days_of_week).unwrap(),
            &serde_json::to_string(&body.exception_events).unwrap(),
            body.enabled,
        )
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_quiet_hours(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.db.delete_quiet_hours(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn notification_history(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::NotificationHistoryEntry>>, AppError> {
    Ok(Json(app.db.list_notification_history(200).await?))
}

// Hooks & webhooks

async fn list_hooks(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::HookDefinition>>, AppError> {
    Ok(Json(app.db.list_hooks().await?))
}

#[derive(Debug, Deserialize)]
struct HookBody {
    id: Option<i64>,
    name: String,
    #[serde(default)]
    events: Vec<String>,
    command: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

async fn upsert_hook(
    State(app): State<AppState>,
    Json(body): Json<HookBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = serde_json::to_string(&body.events).unwrap();
    let id = app
        .db
        .upsert_hook(body.id, &body.name, &filter, &body.command, body.enabled)
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_hook(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.db.delete_hook(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn test_hook(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::events::hooks::test_hook(app.db, id).await?;
    let logs = app.db.list_hook_logs(Some(id)).await?;
    Ok(Json(json!({ "log": logs.first() })))
}

#[derive(Debug, Deserialize)]
struct HookLogsQuery {
    hook_id: Option<i64>,
}

async fn hook_logs(
    State(app): State<AppState>,
    Query(query): Query<HookLogsQuery>,
) -> Result<Json<Vec<crate::db::HookLog>>, AppError> {
    Ok(Json(app.db.list_hook_logs(query.hook_id).await?))
}

async fn clear_hook_logs(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let removed = app.db.clear_hook_logs().await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn list_webhooks(
    State(app): State<AppState>,
) -> Result<Json<Vec<crate::db::WebhookDefinition>>, AppError> {
    Ok(Json(app.db.list_webhooks().await?))
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    id: Option<i64>,
    name: String,
    #[serde(default)]
    events: Vec<String>,
    url: String,
    template: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

async fn upsert_webhook(
    State(app): State<AppState>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !body.url.starts_with("http://") && !body.url.starts_with("https://") {
        return Err(AppError::bad_request("webhook url must be http(s)"));
    }
    let filter = serde_json::to_string(&body.events).unwrap();
    let id = app
        .db
        .upsert_webhook(
            body.id,
            &body.name,
            &filter,
            &body.url,
            body.template.as_deref(),
            body.enabled,
        )
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_webhook(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.db.delete_webhook(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// Configuration & system

async fn get_configuration(State(_app): State<AppState>) -> Json<Vec<config::SerializedSetting>> {
    Json(CONFIG.json())
}

async fn patch_configuration(
    State(app): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<config::ConfigurationApplyResult>, AppError> {
    let keys: Vec<String> = body
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    let result = CONFIG.apply_json(body)?;
    if let Err(e) = config::ConfigFile::write_current().await {
        tracing::error!("Failed to persist configuration: {e}");
    }
    app.events.publish(Event::ConfigUpdated { keys });
    Ok(Json(result))
}

async fn system_status(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let summary = app.db.wanted_summary().await?;
    let uptime = config::APP_RESOURCES
        .start_time
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(Json(json!({
        "version": config::APP_RESOURCES.app_version,
        "uptime_seconds": uptime,
        "wanted": summary,
        "providers": app.providers.provider_names(),
        "translation_backends": app.translator.backend_names(),
    })))
}
