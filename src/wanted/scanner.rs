use std::{
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::LibraryManager,
    config::{self, CONFIG},
    db::{Db, NewWantedItem, WantedStatus},
    events::{Event, EventBus},
    profiles::{required_tracks, LanguageProfile},
    utils::now_secs,
    wanted::{observed_subtitles, MediaFile},
};

#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub files: usize,
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
    pub duration_ms: u64,
}

/// Reconciles the observed library against the desired-subtitle policy and
/// owns creation and cleanup of wanted items.
pub struct WantedScanner {
    db: &'static Db,
    events: EventBus,
    library_managers: std::sync::Mutex<Vec<Arc<dyn LibraryManager>>>,
}

impl std::fmt::Debug for WantedScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WantedScanner").finish()
    }
}

const LAST_FULL_SCAN_KEY: &str = "scanner.last_full_scan_at";
const SCAN_CYCLE_KEY: &str = "scanner.cycle";

impl WantedScanner {
    pub fn new(db: &'static Db, events: EventBus) -> Self {
        Self {
            db,
            events,
            library_managers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn add_library_manager(&self, manager: Arc<dyn LibraryManager>) {
        self.library_managers.lock().unwrap().push(manager);
    }

    fn managers(&self) -> Vec<Arc<dyn LibraryManager>> {
        self.library_managers.lock().unwrap().clone()
    }

    /// Scheduled entry point. Every Nth cycle is a full scan; in between,
    /// only items the library manager reports as changed are re-inspected.
    pub async fn scan(&self, cancellation: CancellationToken) -> anyhow::Result<ScanStats> {
        let full_every: config::FullScanEvery = CONFIG.get_value();
        let cycle: u64 = match self.db.state_get(SCAN_CYCLE_KEY).await? {
            Some(value) => value.parse().unwrap_or(0),
            None => 0,
        };
        self.db
            .state_set(SCAN_CYCLE_KEY, &(cycle + 1).to_string())
            .await?;
        let full = full_every.0 != 0 && cycle % full_every.0 as u64 == 0;
        if full {
            self.full_scan(cancellation).await
        } else {
            self.incremental_scan(cancellation).await
        }
    }

    pub async fn full_scan(&self, cancellation: CancellationToken) -> anyhow::Result<ScanStats> {
        let mut stats = ScanStats::default();
        for manager in self.managers() {
            let instance = manager.instance_name().to_string();
            self.events.publish(Event::ScanStarted {
                instance: instance.clone(),
            });
            let files = match snapshot_manager(manager.as_ref()).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::error!(instance = %instance, "Library snapshot failed: {e}");
                    continue;
                }
            };
            let part = self
                .reconcile(files, Some(&instance), cancellation.clone())
                .await?;
            stats.merge(&part);
        }
        self.db
            .state_set(LAST_FULL_SCAN_KEY, &now_secs().to_string())
            .await?;
        Ok(stats)
    }

    async fn incremental_scan(
        &self,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ScanStats> {
        let since: i64 = match self.db.state_get(LAST_FULL_SCAN_KEY).await? {
            Some(value) => value.parse().unwrap_or(0),
            None => 0,
        };
        let mut stats = ScanStats::default();
        for manager in self.managers() {
            let instance = manager.instance_name().to_string();
            let changes = match manager.changes_since(since).await {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::warn!(instance = %instance, "changes_since failed, skipping: {e}");
                    continue;
                }
            };
            if changes.series_ids.is_empty() && changes.movie_ids.is_empty() {
                continue;
            }
            let mut files = Vec::new();
            for series_id in &changes.series_ids {
                match snapshot_series(manager.as_ref(), series_id).await {
                    Ok(mut part) => files.append(&mut part),
                    Err(e) => tracing::warn!(series_id = %series_id, "Failed to list episodes: {e}"),
                }
            }
            if !changes.movie_ids.is_empty() {
                match snapshot_movies(manager.as_ref(), Some(&changes.movie_ids)).await {
                    Ok(mut part) => files.append(&mut part),
                    Err(e) => tracing::warn!("Failed to list movies: {e}"),
                }
            }
            // incremental runs never drive file-path cleanup: a partial
            // snapshot would read as mass deletion
            let part = self.reconcile(files, None, cancellation.clone()).await?;
            stats.merge(&part);
        }
        Ok(stats)
    }

    /// Reconcile a batch of media files: create missing items, refresh
    /// changed ones, flag upgrade candidates, and (for full snapshots)
    /// remove items whose files disappeared.
    pub async fn reconcile(
        &self,
        files: Vec<MediaFile>,
        cleanup_instance: Option<&str>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ScanStats> {
        let started = Instant::now();
        let workers: config::ScanWorkers = CONFIG.get_value();
        let semaphore = Arc::new(Semaphore::new(workers.0.max(1)));
        let mut stats = ScanStats {
            files: files.len(),
            ..Default::default()
        };
        let mut seen_paths: HashSet<String> = HashSet::with_capacity(files.len());

        let mut handles = Vec::with_capacity(files.len());
        for file in files {
            seen_paths.insert(file.path.to_string_lossy().to_string());
            if cancellation.is_cancelled() {
                break;
            }
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let observed = observed_subtitles(&file.path, &file.existing_subs);
                (file, observed)
            }));
        }

        // write phase is serialized through the store's write discipline
        for handle in handles {
            let Ok((file, observed)) = handle.await else {
                continue;
            };
            if cancellation.is_cancelled() {
                break;
            }
            match self.reconcile_file(&file, &observed).await {
                Ok((created, updated, removed)) => {
                    stats.created += created;
                    stats.updated += updated;
                    stats.removed += removed;
                }
                Err(e) => {
                    tracing::error!(path = %file.path.display(), "Reconcile failed: {e}")
                }
            }
        }

        if let Some(instance) = cleanup_instance {
            if !cancellation.is_cancelled() {
                stats.removed += self
                    .db
                    .cleanup_wanted_missing_files(instance, &seen_paths)
                    .await?;
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.events.publish(Event::ScanComplete {
            instance: cleanup_instance.unwrap_or("incremental").to_string(),
            created: stats.created,
            updated: stats.updated,
            removed: stats.removed,
            duration_ms: stats.duration_ms,
        });
        Ok(stats)
    }

    async fn reconcile_file(
        &self,
        file: &MediaFile,
        observed: &[crate::wanted::ObservedSubtitle],
    ) -> anyhow::Result<(u64, u64, u64)> {
        let profile_row = self.db.profile_for_source(&file.source_ref).await?;
        let profile = LanguageProfile::from_db(&profile_row)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let required = required_tracks(&file.embedded_streams, &profile);
        let file_path = file.path.to_string_lossy().to_string();

        let mut created = 0;
        let mut updated = 0;
        let mut removed = 0;
        let missing_languages: Vec<String> = required
            .iter()
            .filter(|(lang, kind)| {
                !observed
                    .iter()
                    .any(|o| o.language == *lang && o.kind == *kind)
            })
            .map(|(lang, _)| lang.clone())
            .collect();

        for (language, kind) in &required {
            let existing = observed
                .iter()
                .find(|o| &o.language == language && &o.kind == kind);
            match existing {
                None => {
                    let fingerprint =
                        crate::db::wanted_fingerprint(&file_path, language, *kind);
                    let is_new = self
                        .db
                        .get_wanted_by_fingerprint(&fingerprint)
                        .await?
                        .is_none();
                    self.db
                        .upsert_wanted_item(new_item(
                            file,
                            profile.id,
                            language,
                            *kind,
                            &missing_languages,
                            None,
                            None,
                            false,
                        ))
                        .await?;
                    if is_new {
                        created += 1;
                        self.events.publish(Event::WantedItemAdded {
                            title: file.title.clone(),
                            language: language.clone(),
                            subtitle_type: kind.to_string(),
                        });
                    } else {
                        updated += 1;
                    }
                }
                Some(observed_sub) => {
                    let score = self
                        .db
                        .latest_download_score(&file_path, language, *kind)
                        .await?;
                    let upgradeable = score
                        .map(|s| s < profile.upgrade_threshold)
                        .unwrap_or(false);
                    if upgradeable {
                        let id = self
                            .db
                            .upsert_wanted_item(new_item(
                                file,
                                profile.id,
                                language,
                                *kind,
                                &missing_languages,
                                Some(observed_sub.path.to_string_lossy().to_string()),
                                score,
                                true,
                            ))
                            .await?;
                        // an upgrade candidate goes back into the search queue
                        self.db
                            .transition_status(
                                id,
                                &[WantedStatus::Downloaded, WantedStatus::Translated],
                                WantedStatus::Wanted,
                            )
                            .await?;
                        updated += 1;
                    } else {
                        // satisfied and not upgradeable: drop any leftover item
                        let fingerprint =
                            crate::db::wanted_fingerprint(&file_path, language, *kind);
                        if let Some(item) =
                            self.db.get_wanted_by_fingerprint(&fingerprint).await?
                        {
                            if item.status != WantedStatus::Ignored {
                                self.db.delete_wanted(item.id).await?;
                                removed += 1;
                                self.events.publish(Event::WantedItemRemoved {
                                    title: file.title.clone(),
                                    language: language.clone(),
                                    subtitle_type: kind.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok((created, updated, removed))
    }

}

#[allow(clippy::too_many_arguments)]
fn new_item(
    file: &MediaFile,
    profile_id: i64,
    language: &str,
    kind: crate::subtitles::SubtitleKind,
    missing_languages: &[String],
    existing_subtitle_path: Option<String>,
    existing_score: Option<i64>,
    upgrade_candidate: bool,
) -> NewWantedItem {
    NewWantedItem {
        item_kind: file.item_kind,
        source_ref: file.source_ref.clone(),
        file_path: file.path.to_string_lossy().to_string(),
        title: file.title.clone(),
        season: file.season,
        episode: file.episode,
        year: file.year,
        target_language: language.to_string(),
        subtitle_type: kind,
        missing_languages: missing_languages.to_vec(),
        existing_subtitle_path,
        existing_score,
        upgrade_candidate,
        instance_name: file.instance_name.clone(),
        profile_id,
    }
}

impl ScanStats {
    fn merge(&mut self, other: &ScanStats) {
        self.files += other.files;
        self.created += other.created;
        self.updated += other.updated;
        self.removed += other.removed;
        self.duration_ms += other.duration_ms;
    }
}

async fn snapshot_manager(manager: &dyn LibraryManager) -> anyhow::Result<Vec<MediaFile>> {
    let mut files = Vec::new();
    for series in manager.list_series().await? {
        files.append(&mut snapshot_series(manager, &series.id).await?);
    }
    files.append(&mut snapshot_movies(manager, None).await?);
    Ok(files)
}

async fn snapshot_series(
    manager: &dyn LibraryManager,
    series_id: &str,
) -> anyhow::Result<Vec<MediaFile>> {
    let instance = manager.instance_name().to_string();
    let series = manager
        .list_series()
        .await?
        .into_iter()
        .find(|s| s.id == series_id);
    let (title, year) = series
        .map(|s| (s.title, s.year))
        .unwrap_or_else(|| (series_id.to_string(), None));
    let episodes = manager.list_episodes(series_id).await?;
    Ok(episodes
        .into_iter()
        .map(|episode| MediaFile {
            item_kind: crate::db::ItemKind::Episode,
            source_ref: format!("{instance}:series:{series_id}"),
            instance_name: instance.clone(),
            title: title.clone(),
            season: Some(episode.season),
            episode: Some(episode.episode),
            year,
            path: episode.path,
            existing_subs: episode.existing_subs,
            embedded_streams: episode.embedded_streams,
        })
        .collect())
}

async fn snapshot_movies(
    manager: &dyn LibraryManager,
    only_ids: Option<&[String]>,
) -> anyhow::Result<Vec<MediaFile>> {
    let instance = manager.instance_name().to_string();
    Ok(manager
        .list_movies()
        .await?
        .into_iter()
        .filter(|movie| only_ids.map(|ids| ids.contains(&movie.id)).unwrap_or(true))
        .map(|movie| MediaFile {
            item_kind: crate::db::ItemKind::Movie,
            source_ref: format!("{instance}:movie:{}", movie.id),
            instance_name: instance.clone(),
            title: movie.title,
            season: None,
            episode: None,
            year: movie.year,
            path: movie.path,
            existing_subs: movie.existing_subs,
            embedded_streams: movie.embedded_streams,
        })
        .collect())
}
