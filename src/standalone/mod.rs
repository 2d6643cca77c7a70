use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{FilesystemSource, LocalFilesystem, MetadataResolver},
    config::{self, CONFIG},
    db::{Db, ItemKind},
    events::EventBus,
    subtitles::is_video_file,
    wanted::{
        scanner::{ScanStats, WantedScanner},
        MediaFile,
    },
};

pub mod scanner;
pub mod watcher;

use scanner::{normalize_title, parse_media_filename, ParsedFilename};

pub const INSTANCE_NAME: &str = "standalone";

/// Filesystem-backed media source: groups watched directories into
/// standalone series/movies and feeds them through the wanted scanner.
pub struct StandaloneSource {
    db: &'static Db,
    events: EventBus,
    filesystem: Box<dyn FilesystemSource>,
    resolver: Mutex<Option<Arc<dyn MetadataResolver>>>,
}

impl std::fmt::Debug for StandaloneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaloneSource").finish()
    }
}

#[derive(Debug, Clone)]
struct GroupedFile {
    path: PathBuf,
    parsed: ParsedFilename,
}

impl StandaloneSource {
    pub fn new(db: &'static Db, events: EventBus) -> Self {
        Self {
            db,
            events,
            filesystem: Box::new(LocalFilesystem),
            resolver: Mutex::new(None),
        }
    }

    pub fn set_resolver(&self, resolver: Arc<dyn MetadataResolver>) {
        *self.resolver.lock().unwrap() = Some(resolver);
    }

    fn resolver(&self) -> Option<Arc<dyn MetadataResolver>> {
        self.resolver.lock().unwrap().clone()
    }

    /// Full-tree rescan of every configured directory.
    pub async fn scan(
        &self,
        wanted: &WantedScanner,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ScanStats> {
        let folders: config::StandaloneFolders = CONFIG.get_value();
        let mut paths = Vec::new();
        for root in folders.existing() {
            let walked = self.filesystem.walk(root)?;
            paths.extend(walked.into_iter().filter(is_video_file));
        }
        self.scan_paths(wanted, paths, Some(INSTANCE_NAME), cancellation)
            .await
    }

    /// Scan a specific set of files (watcher deliveries). No cleanup pass:
    /// a partial file list must not delete sibling items.
    pub async fn scan_files(
        &self,
        wanted: &WantedScanner,
        paths: Vec<PathBuf>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ScanStats> {
        self.scan_paths(wanted, paths, None, cancellation).await
    }

    async fn scan_paths(
        &self,
        wanted: &WantedScanner,
        paths: Vec<PathBuf>,
        cleanup_instance: Option<&str>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ScanStats> {
        let mut series_groups: HashMap<(String, Option<i64>), Vec<GroupedFile>> = HashMap::new();
        let mut movies: Vec<GroupedFile> = Vec::new();

        for path in paths {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_anime = scanner::detect_anime(file_name);
            let mut parsed = parse_media_filename(file_name, is_anime);
            if parsed.title.is_empty() {
                // parent directory name is the title of last resort
                if let Some(parent) = path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str())
                {
                    parsed.title = scanner::parse_media_filename(parent, false).title;
                }
            }
            if parsed.title.is_empty() {
                tracing::warn!(path = %path.display(), "Could not identify file, skipping");
                continue;
            }
            let grouped = GroupedFile { path, parsed };
            if grouped.parsed.is_episode() {
                let key = (
                    normalize_title(&grouped.parsed.title),
                    grouped.parsed.year,
                );
                series_groups.entry(key).or_default().push(grouped);
            } else {
                movies.push(grouped);
            }
        }

        let mut files: Vec<MediaFile> = Vec::new();
        for ((normalized, year), group) in series_groups {
            if cancellation.is_cancelled() {
                break;
            }
            match self.persist_series(&normalized, year, &group).await {
                Ok(mut media) => files.append(&mut media),
                Err(e) => tracing::error!(series = %normalized, "Failed to persist series: {e}"),
            }
        }
        for movie in movies {
            if cancellation.is_cancelled() {
                break;
            }
            match self.persist_movie(&movie).await {
                Ok(media) => files.push(media),
                Err(e) => {
                    tracing::error!(path = %movie.path.display(), "Failed to persist movie: {e}")
                }
            }
        }

        wanted.reconcile(files, cleanup_instance, cancellation).await
    }

    async fn persist_series(
        &self,
        normalized: &str,
        year: Option<i64>,
        group: &[GroupedFile],
    ) -> anyhow::Result<Vec<MediaFile>> {
        let display_title = group
            .iter()
            .map(|g| g.parsed.title.clone())
            .max_by_key(|t| t.len())
            .unwrap_or_else(|| normalized.to_string());
        let group_is_anime = group.iter().any(|g| g.parsed.is_anime);

        let resolved = match self.resolver() {
            Some(resolver) => resolver
                .resolve_series(&display_title, year, group_is_anime)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(title = %display_title, "Metadata resolution failed: {e}");
                    None
                }),
            None => None,
        };
        // the resolver can promote to anime retroactively
        let is_anime = group_is_anime || resolved.as_ref().map(|r| r.is_anime).unwrap_or(false);
        let title = resolved
            .as_ref()
            .map(|r| r.title.clone())
            .unwrap_or(display_title);
        let year = resolved.as_ref().and_then(|r| r.year).or(year);

        let series_id = self
            .db
            .upsert_standalone_series(
                &title,
                normalized,
                year,
                resolved.as_ref().map(|r| r.provider.as_str()),
                resolved.as_ref().map(|r| r.id.as_str()),
                is_anime,
            )
            .await?;

        Ok(group
            .iter()
            .map(|g| MediaFile {
                item_kind: ItemKind::Episode,
                source_ref: format!("standalone_series:{series_id}"),
                instance_name: INSTANCE_NAME.to_string(),
                title: title.clone(),
                season: g.parsed.season,
                episode: g.parsed.episode,
                year,
                path: g.path.clone(),
                existing_subs: Vec::new(),
                embedded_streams: Vec::new(),
            })
            .collect())
    }

    async fn persist_movie(&self, movie: &GroupedFile) -> anyhow::Result<MediaFile> {
        let resolved = match self.resolver() {
            Some(resolver) => resolver
                .resolve_movie(&movie.parsed.title, movie.parsed.year, movie.parsed.is_anime)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(title = %movie.parsed.title, "Metadata resolution failed: {e}");
                    None
                }),
            None => None,
        };
        let is_anime =
            movie.parsed.is_anime || resolved.as_ref().map(|r| r.is_anime).unwrap_or(false);
        let title = resolved
            .as_ref()
            .map(|r| r.title.clone())
            .unwrap_or_else(|| movie.parsed.title.clone());
        let year = resolved.as_ref().and_then(|r| r.year).or(movie.parsed.year);
        let file_path = movie.path.to_string_lossy().to_string();

        let movie_id = self
            .db
            .upsert_standalone_movie(
                &title,
                &normalize_title(&title),
                year,
                &file_path,
                resolved.as_ref().map(|r| r.provider.as_str()),
                resolved.as_ref().map(|r| r.id.as_str()),
                is_anime,
            )
            .await?;

        Ok(MediaFile {
            item_kind: ItemKind::Movie,
            source_ref: format!("standalone_movie:{movie_id}"),
            instance_name: INSTANCE_NAME.to_string(),
            title,
            season: None,
            episode: None,
            year,
            path: movie.path.clone(),
            existing_subs: Vec::new(),
            embedded_streams: Vec::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
