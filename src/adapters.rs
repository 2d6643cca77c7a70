use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{db::Db, profiles::EmbeddedStream};

/// Health of an external collaborator, surfaced by the detailed health
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CollaboratorStatus {
    pub healthy: bool,
    pub message: String,
}

impl CollaboratorStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: "ok".to_string(),
        }
    }

    pub fn unhealthy(message: impl AsRef<str>) -> Self {
        Self {
            healthy: false,
            message: message.as_ref().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub title: String,
    pub year: Option<i64>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub path: PathBuf,
    pub season: i64,
    pub episode: i64,
    #[serde(default)]
    pub existing_subs: Vec<PathBuf>,
    #[serde(default)]
    pub embedded_streams: Vec<EmbeddedStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub title: String,
    pub year: Option<i64>,
    pub path: PathBuf,
    #[serde(default)]
    pub existing_subs: Vec<PathBuf>,
    #[serde(default)]
    pub embedded_streams: Vec<EmbeddedStream>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub series_ids: Vec<String>,
    pub movie_ids: Vec<String>,
}

/// An external library manager exposing series, movies and their files.
#[async_trait]
pub trait LibraryManager: Send + Sync {
    /// Origin marker recorded on wanted items created from this source.
    fn instance_name(&self) -> &str;
    async fn list_series(&self) -> anyhow::Result<Vec<Series>>;
    async fn list_episodes(&self, series_id: &str) -> anyhow::Result<Vec<Episode>>;
    async fn list_movies(&self) -> anyhow::Result<Vec<Movie>>;
    /// Items changed since the timestamp. Implementations disagree on the
    /// exact semantics, so callers always keep a periodic full scan.
    async fn changes_since(&self, timestamp: i64) -> anyhow::Result<ChangeSet>;
    async fn health(&self) -> CollaboratorStatus;
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn refresh_item(&self, path: &Path) -> anyhow::Result<()>;
    async fn health(&self) -> CollaboratorStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedMetadata {
    pub provider: String,
    pub id: String,
    pub title: String,
    pub year: Option<i64>,
    pub is_anime: bool,
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve_series(
        &self,
        title: &str,
        year: Option<i64>,
        is_anime: bool,
    ) -> anyhow::Result<Option<ResolvedMetadata>>;
    async fn resolve_movie(
        &self,
        title: &str,
        year: Option<i64>,
        is_anime: bool,
    ) -> anyhow::Result<Option<ResolvedMetadata>>;
}

/// Opaque delivery channel for notifications; the concrete transport
/// (apprise, gotify, ...) lives outside this crate.
#[async_trait]
pub trait NotificationDelivery: Send + Sync {
    fn service_name(&self) -> &str;
    async fn send(&self, service_url: &str, title: &str, body: &str) -> anyhow::Result<()>;
}

pub trait FilesystemSource: Send + Sync {
    fn walk(&self, root: &PathBuf) -> std::io::Result<Vec<PathBuf>>;
}

#[derive(Debug, Default)]
pub struct LocalFilesystem;

impl FilesystemSource for LocalFilesystem {
    fn walk(&self, root: &PathBuf) -> std::io::Result<Vec<PathBuf>> {
        crate::utils::walk_recursive(root, None::<fn(&PathBuf) -> bool>)
    }
}

/// Store-backed TTL cache in front of a metadata resolver.
pub struct CachedMetadataResolver<R> {
    inner: R,
    db: &'static Db,
    ttl_seconds: i64,
}

impl<R: MetadataResolver> CachedMetadataResolver<R> {
    pub fn new(inner: R, db: &'static Db, ttl_seconds: i64) -> Self {
        Self {
            inner,
            db,
            ttl_seconds,
        }
    }

    async fn cached(
        &self,
        key: &str,
    ) -> Option<Option<ResolvedMetadata>> {
        let body = self.db.metadata_cache_get(key).await.ok().flatten()?;
        serde_json::from_str(&body).ok()
    }

    async fn store(&self, key: &str, value: &Option<ResolvedMetadata>) {
        let provider = value
            .as_ref()
            .map(|v| v.provider.clone())
            .unwrap_or_else(|| "none".to_string());
        if let Ok(body) = serde_json::to_string(value) {
            if let Err(e) = self
                .db
                .metadata_cache_set(key, &provider, &body, self.ttl_seconds)
                .await
            {
                tracing::debug!("Failed to cache metadata response: {e}");
            }
        }
    }
}

#[async_trait]
impl<R: MetadataResolver> MetadataResolver for CachedMetadataResolver<R> {
    async fn resolve_series(
        &self,
        title: &str,
        year: Option<i64>,
        is_anime: bool,
    ) -> anyhow::Result<Option<ResolvedMetadata>> {
        let key = format!("series:{}:{}:{}", title.to_lowercase(), year.unwrap_or(0), is_anime);
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }
        let resolved = self.inner.resolve_series(title, year, is_anime).await?;
        self.store(&key, &resolved).await;
        Ok(resolved)
    }

    async fn resolve_movie(
        &self,
        title: &str,
        year: Option<i64>,
        is_anime: bool,
    ) -> anyhow::Result<Option<ResolvedMetadata>> {
        let key = format!("movie:{}:{}:{}", title.to_lowercase(), year.unwrap_or(0), is_anime);
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }
        let resolved = self.inner.resolve_movie(title, year, is_anime).await?;
        self.store(&key, &resolved).await;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataResolver for CountingResolver {
        async fn resolve_series(
            &self,
            title: &str,
            year: Option<i64>,
            is_anime: bool,
        ) -> anyhow::Result<Option<ResolvedMetadata>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ResolvedMetadata {
                provider: "tmdb".into(),
                id: "42".into(),
                title: title.to_string(),
                year,
                is_anime,
            }))
        }

        async fn resolve_movie(
            &self,
            _title: &str,
            _year: Option<i64>,
            _is_anime: bool,
        ) -> anyhow::Result<Option<ResolvedMetadata>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn cached_resolver_hits_the_backend_once() {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db: &'static Db = Box::leak(Box::new(db));
        let resolver = CachedMetadataResolver::new(
            CountingResolver {
                calls: AtomicUsize::new(0),
            },
            db,
            3600,
        );

        let first = resolver
            .resolve_series("Frieren", Some(2023), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.provider, "tmdb");
        let second = resolver
            .resolve_series("Frieren", Some(2023), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 1);

        // negative results are cached too
        resolver.resolve_movie("Nothing", None, false).await.unwrap();
        resolver.resolve_movie("Nothing", None, false).await.unwrap();
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 2);
    }
}
