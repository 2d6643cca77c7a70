use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppError,
    config::{self, CONFIG},
    db::{Db, DuplicateGroup},
    events::{Event, EventBus},
    subtitles::{is_subtitle_file, is_video_file, SubtitlePath},
    utils::sha256_hex,
};

/// Bit-exact content hash for deduplication: strip outer whitespace,
/// normalize CRLF and lone CR to LF, SHA-256 over the UTF-8 bytes.
pub fn normalized_content_hash(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let normalized = text.trim().replace("\r\n", "\n").replace('\r', "\n");
    sha256_hex(normalized.as_bytes())
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupDecision {
    pub keep: String,
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupScanStats {
    pub files_hashed: usize,
    pub duplicate_groups: usize,
}

pub fn subtitle_files_in_roots() -> Result<Vec<PathBuf>, AppError> {
    let roots: config::DedupRoots = CONFIG.get_value();
    let roots = if roots.0.is_empty() {
        let standalone: config::StandaloneFolders = CONFIG.get_value();
        standalone.0
    } else {
        roots.0
    };
    let mut paths = Vec::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        paths.extend(crate::utils::walk_recursive(&root, Some(is_subtitle_file))?);
    }
    Ok(paths)
}

#[derive(Debug)]
pub struct DedupEngine {
    db: &'static Db,
    events: EventBus,
}

impl DedupEngine {
    pub fn new(db: &'static Db, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Walk the configured roots and refresh the content-hash table.
    pub async fn scan(&self) -> Result<DedupScanStats, AppError> {
        let paths = subtitle_files_in_roots()?;
        let mut stats = DedupScanStats::default();
        for path in paths {
            match self.hash_file(&path).await {
                Ok(()) => stats.files_hashed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Hashing failed: {}", e.message)
                }
            }
        }
        stats.duplicate_groups = self.db.duplicate_groups().await?.len();
        self.events.publish(Event::DedupScanComplete {
            files_hashed: stats.files_hashed,
            duplicate_groups: stats.duplicate_groups,
        });
        Ok(stats)
    }

    pub async fn hash_file(&self, path: &Path) -> Result<(), AppError> {
        let bytes = tokio::fs::read(path).await?;
        let hash = normalized_content_hash(&bytes);
        let line_count = bytes.iter().filter(|b| **b == b'\n').count() as i64 + 1;
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("unknown")
            .to_lowercase();
        let language = SubtitlePath::parse(path).map(|p| p.language);
        self.db
            .hash_upsert(
                &path.to_string_lossy(),
                &hash,
                bytes.len() as i64,
                &format,
                language.as_deref(),
                line_count,
            )
            .await?;
        Ok(())
    }

    pub async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, sqlx::Error> {
        self.db.duplicate_groups().await
    }

    /// Delete duplicates per the submitted decisions. The whole request is
    /// validated before the first deletion: every group must keep at least
    /// one file, and no keep may double as a delete. On any violation
    /// nothing is deleted.
    pub async fn delete_duplicates(
        &self,
        decisions: &[GroupDecision],
    ) -> Result<usize, AppError> {
        for (index, decision) in decisions.iter().enumerate() {
            if decision.keep.is_empty() {
                return Err(AppError::bad_request(format!(
                    "group {index} has no keep selection"
                )));
            }
            if decision.delete.iter().any(|d| d == &decision.keep) {
                return Err(AppError::bad_request(format!(
                    "group {index} deletes its keep selection"
                )));
            }
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for decision in decisions {
            for path in &decision.delete {
                if !seen.insert(path.as_str()) {
                    return Err(AppError::bad_request(format!(
                        "duplicate delete entry: {path}"
                    )));
                }
            }
        }

        let mut removed = 0usize;
        for decision in decisions {
            for path in &decision.delete {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {
                        self.db.hash_remove(path).await?;
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // already gone; drop the stale hash row
                        self.db.hash_remove(path).await?;
                    }
                    Err(e) => {
                        tracing::error!(path = %path, "Failed to delete duplicate: {e}");
                    }
                }
            }
        }
        self.db
            .cleanup_record(
                "dedup_delete",
                &format!("{} groups", decisions.len()),
                removed as i64,
            )
            .await?;
        self.events.publish(Event::DuplicatesDeleted {
            groups: decisions.len(),
            files_removed: removed,
        });
        Ok(removed)
    }

    /// Subtitles whose basename has no matching video file in the same
    /// directory.
    pub async fn orphans(&self) -> Result<Vec<PathBuf>, AppError> {
        let paths = subtitle_files_in_roots()?;
        let mut orphans = Vec::new();
        for path in paths {
            let Some(parsed) = SubtitlePath::parse(&path) else {
                continue;
            };
            let Some(dir) = path.parent() else {
                continue;
            };
            // sidecars may live one level down in Subs/Subtitles
            let video_dirs = [Some(dir), dir.parent()];
            let mut has_video = false;
            'outer: for dir in video_dirs.into_iter().flatten() {
                let Ok(entries) = std::fs::read_dir(dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let candidate = entry.path();
                    if is_video_file(&candidate)
                        && candidate
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .map(|s| s == parsed.video_basename)
                            .unwrap_or(false)
                    {
                        has_video = true;
                        break 'outer;
                    }
                }
            }
            if !has_video {
                orphans.push(path);
            }
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_normalizes_line_endings_and_padding() {
        let unix = normalized_content_hash(b"1\n00:00:01,000 --> 00:00:02,000\nhi\n");
        let windows = normalized_content_hash(b"1\r\n00:00:01,000 --> 00:00:02,000\r\nhi\r\n");
        let padded = normalized_content_hash(b"\n1\n00:00:01,000 --> 00:00:02,000\nhi\n\n");
        assert_eq!(unix, windows);
        assert_eq!(unix, padded);
        let different = normalized_content_hash(b"1\n00:00:01,000 --> 00:00:02,000\nbye\n");
        assert_ne!(unix, different);
    }

    async fn engine() -> DedupEngine {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db: &'static Db = Box::leak(Box::new(db));
        DedupEngine::new(db, EventBus::sink())
    }

    #[tokio::test]
    async fn deletion_refuses_batch_without_keep() {
        let engine = engine().await;
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.en.srt");
        let b = dir.path().join("b.en.srt");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();

        let bad = vec![
            GroupDecision {
                keep: "".into(),
                delete: vec![a.to_string_lossy().to_string()],
            },
            GroupDecision {
                keep: b.to_string_lossy().to_string(),
                delete: vec![a.to_string_lossy().to_string()],
            },
        ];
        let err = engine.delete_duplicates(&bad).await.unwrap_err();
        assert!(err.message.contains("no keep selection"));
        // nothing was deleted
        assert!(a.exists());
        assert!(b.exists());
    }

    #[tokio::test]
    async fn valid_deletion_removes_files_and_rows() {
        let engine = engine().await;
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.en.srt");
        let b = dir.path().join("b.en.srt");
        std::fs::write(&a, "same content").unwrap();
        std::fs::write(&b, "same content").unwrap();
        engine.hash_file(&a).await.unwrap();
        engine.hash_file(&b).await.unwrap();
        assert_eq!(engine.duplicate_groups().await.unwrap().len(), 1);

        let decisions = vec![GroupDecision {
            keep: a.to_string_lossy().to_string(),
            delete: vec![b.to_string_lossy().to_string()],
        }];
        let removed = engine.delete_duplicates(&decisions).await.unwrap();
        assert_eq!(removed, 1);
        assert!(a.exists());
        assert!(!b.exists());
        assert!(engine.duplicate_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keep_listed_as_delete_rejects_batch() {
        let engine = engine().await;
        let decisions = vec![GroupDecision {
            keep: "/s/a.srt".into(),
            delete: vec!["/s/a.srt".into()],
        }];
        let err = engine.delete_duplicates(&decisions).await.unwrap_err();
        assert!(err.message.contains("deletes its keep selection"));
    }
}
