use std::{path::Path, sync::Arc, time::Instant};

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::MediaServer,
    app_state::{AppError, AppErrorKind},
    config::{self, CONFIG},
    db::{Db, WantedItem, WantedStatus},
    events::{Event, EventBus},
    health::{backup_file, dedup::normalized_content_hash},
    profiles::LanguageProfile,
    providers::{
        forced_patterns,
        scorer::{rank, ScoreWeights, ScoredCandidate},
        ProviderRegistry, VideoQuery,
    },
    standalone::scanner::parse_media_filename,
    subtitles::{SubtitleKind, SubtitlePath, Subtitles},
    translation::Translator,
    wanted::observed_subtitles,
};

#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

enum ItemOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Drives wanted items through providers, scoring, download, verification
/// and the translation fallback.
pub struct WantedSearcher {
    db: &'static Db,
    providers: &'static ProviderRegistry,
    translator: &'static Translator,
    events: EventBus,
    media_servers: std::sync::Mutex<Vec<Arc<dyn MediaServer>>>,
}

impl std::fmt::Debug for WantedSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WantedSearcher").finish()
    }
}

impl WantedSearcher {
    pub fn new(
        db: &'static Db,
        providers: &'static ProviderRegistry,
        translator: &'static Translator,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            providers,
            translator,
            events,
            media_servers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Media servers to poke after a subtitle lands next to their files.
    pub fn add_media_server(&self, server: Arc<dyn MediaServer>) {
        self.media_servers.lock().unwrap().push(server);
    }

    /// Claim and process one batch of wanted items. Items claimed but not
    /// processed before cancellation are released back to `wanted`.
    pub async fn search_batch(&self, cancellation: CancellationToken) -> anyhow::Result<BatchStats> {
        let started = Instant::now();
        let workers: config::SearchWorkers = CONFIG.get_value();
        let depth: config::SearchQueueDepth = CONFIG.get_value();
        let batch_size = (workers.0.max(1) * depth.0.max(1)) as i64;

        let items = self.db.claim_search_batch(batch_size).await?;
        let mut stats = BatchStats {
            total: items.len(),
            ..Default::default()
        };
        if items.is_empty() {
            return Ok(stats);
        }
        self.events.publish(Event::SearchStarted { items: items.len() });

        let semaphore = Arc::new(Semaphore::new(workers.0.max(1)));
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            if cancellation.is_cancelled() {
                // release unprocessed claims
                let _ = self
                    .db
                    .transition_status(item.id, &[WantedStatus::Searching], WantedStatus::Wanted)
                    .await;
                stats.skipped += 1;
                continue;
            }
            let semaphore = semaphore.clone();
            let cancellation = cancellation.clone();
            let this = SearcherHandle {
                db: self.db,
                providers: self.providers,
                translator: self.translator,
                events: self.events.clone(),
                media_servers: self.media_servers.lock().unwrap().clone(),
            };
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if cancellation.is_cancelled() {
                    let _ = this
                        .db
                        .transition_status(item.id, &[WantedStatus::Searching], WantedStatus::Wanted)
                        .await;
                    return ItemOutcome::Skipped;
                }
                this.process_item(item).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(ItemOutcome::Succeeded) => stats.succeeded += 1,
                Ok(ItemOutcome::Failed) => stats.failed += 1,
                Ok(ItemOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    tracing::error!("Search worker panicked: {e}");
                    stats.failed += 1;
                }
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.events.publish(Event::BatchComplete {
            total: stats.total,
            succeeded: stats.succeeded,
            failed: stats.failed,
            skipped: stats.skipped,
            duration_ms: stats.duration_ms,
        });
        Ok(stats)
    }
}

/// Borrowed view of the searcher that can move into worker tasks.
struct SearcherHandle {
    db: &'static Db,
    providers: &'static ProviderRegistry,
    translator: &'static Translator,
    events: EventBus,
    media_servers: Vec<Arc<dyn MediaServer>>,
}

impl SearcherHandle {
    async fn process_item(&self, item: WantedItem) -> ItemOutcome {
        match self.try_item(&item).await {
            Ok(succeeded) => {
                if succeeded {
                    ItemOutcome::Succeeded
                } else {
                    self.handle_failure(&item, AppError::permanent("no acceptable candidate"))
                        .await
                }
            }
            Err(e) if e.kind == AppErrorKind::Contention => ItemOutcome::Skipped,
            Err(e) => self.handle_failure(&item, e).await,
        }
    }

    async fn try_item(&self, item: &WantedItem) -> Result<bool, AppError> {
        let profile_row = self.db.profile_for_source(&item.source_ref).await?;
        let profile = LanguageProfile::from_db(&profile_row)?;
        let query = self.build_query(item).await;
        let kind = item.subtitle_kind();
        let patterns = forced_patterns();

        let outcome = self.providers.search_all(&query).await;
        for provider in &outcome.circuits_opened {
            self.events.publish(Event::ProviderCircuitOpen {
                provider: provider.clone(),
            });
        }

        // blacklist and track-kind filtering
        let mut candidates = Vec::with_capacity(outcome.candidates.len());
        for candidate in outcome.candidates {
            if self
                .db
                .blacklist_contains(&candidate.provider_name, &candidate.external_id)
                .await?
            {
                continue;
            }
            let candidate_kind = candidate.kind(&patterns);
            let matches = match kind {
                SubtitleKind::Full => candidate_kind == SubtitleKind::Full,
                SubtitleKind::Forced | SubtitleKind::Signs => {
                    candidate_kind == SubtitleKind::Forced
                }
            };
            if matches {
                candidates.push(candidate);
            }
        }

        let modifiers: config::ProviderScoreModifiers = CONFIG.get_value();
        let ranked = rank(
            &query,
            candidates,
            &ScoreWeights::default(),
            profile.hearing_impaired_wanted(&item.target_language),
            &modifiers.0,
            &self.providers.priorities(),
        );

        let acceptance = profile.acceptance_threshold;
        let accept = |scored: &ScoredCandidate| -> bool {
            if scored.score < acceptance {
                return false;
            }
            if item.upgrade_candidate {
                let margin: config::UpgradeMargin = CONFIG.get_value();
                let existing = item.existing_score.unwrap_or(0);
                return scored.score > existing + margin.0;
            }
            true
        };

        let best_target = ranked.iter().find(|s| {
            s.candidate
                .language
                .eq_ignore_ascii_case(&item.target_language)
                && accept(s)
        });

        if let Some(best) = best_target {
            self.download_and_save(item, best, kind).await?;
            return Ok(true);
        }

        // translation fallback: best acceptable candidate in any language,
        // or an already-present sidecar in another language
        if let Some(source) = self.translation_source(item, &ranked, kind, &accept).await? {
            self.translate_and_save(item, source, kind).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Three-tier query enrichment: the item's own library-manager metadata,
    /// then the standalone tables, then filename parsing.
    async fn build_query(&self, item: &WantedItem) -> VideoQuery {
        let mut query = VideoQuery {
            title: item.title.clone(),
            year: item.year,
            season: item.season,
            episode: item.episode,
            languages: vec![item.target_language.clone()],
            subtitle_type: Some(item.subtitle_kind()),
            release_group: None,
            resolution: None,
            source_hash: None,
            forced_only: matches!(item.subtitle_kind(), SubtitleKind::Forced | SubtitleKind::Signs),
        };

        if item.instance_name == "standalone" && query.year.is_none() {
            if let Some(series_id) = item.source_ref.strip_prefix("standalone_series:") {
                if let Ok(series) = self.db.list_standalone_series().await {
                    if let Some(series) = series
                        .iter()
                        .find(|s| s.id.to_string() == series_id)
                    {
                        query.year = series.year;
                        if query.title.is_empty() {
                            query.title = series.title.clone();
                        }
                    }
                }
            }
        }

        if let Some(name) = Path::new(&item.file_path).file_name().and_then(|n| n.to_str()) {
            let parsed = parse_media_filename(name, false);
            query.release_group = parsed.release_group;
            query.resolution = parsed.resolution;
            if query.year.is_none() {
                query.year = parsed.year;
            }
            if query.title.is_empty() {
                query.title = parsed.title;
            }
            if query.season.is_none() {
                query.season = parsed.season;
            }
            if query.episode.is_none() {
                query.episode = parsed.episode;
            }
        }
        query
    }

    async fn download_and_save(
        &self,
        item: &WantedItem,
        scored: &ScoredCandidate,
        kind: SubtitleKind,
    ) -> Result<(), AppError> {
        let candidate = &scored.candidate;
        let bytes = self.download_with_retry(candidate).await?;
        let subs = Subtitles::parse_bytes(&bytes)
            .map_err(|e| AppError::content_invalid(format!("downloaded subtitle invalid: {e}")))?;
        let format = subs.format;

        let video_path = Path::new(&item.file_path);
        let target = SubtitlePath::render(video_path, &candidate.language, kind, format);
        backup_file(&target).await?;
        let serialized = subs.serialize(format);
        tokio::fs::write(&target, &serialized).await?;

        let content_hash = normalized_content_hash(&serialized);
        self.db
            .insert_download(
                &item.file_path,
                &candidate.language,
                kind,
                &candidate.provider_name,
                Some(&candidate.external_id),
                scored.score,
                serialized.len() as i64,
                Some(&content_hash),
            )
            .await?;
        self.db
            .record_attempt(item.id, WantedStatus::Downloaded, None)
            .await?;

        if item.upgrade_candidate {
            self.events.publish(Event::SubtitleUpgraded {
                provider: candidate.provider_name.clone(),
                language: candidate.language.clone(),
                score: scored.score,
                previous_score: item.existing_score.unwrap_or(0),
                title: item.title.clone(),
            });
        } else {
            self.events.publish(Event::SubtitleDownloaded {
                provider: candidate.provider_name.clone(),
                language: candidate.language.clone(),
                format: format.to_string(),
                score: scored.score,
                title: item.title.clone(),
                season: item.season,
                episode: item.episode,
            });
        }
        tracing::info!(
            title = %item.title,
            language = %candidate.language,
            provider = %candidate.provider_name,
            score = scored.score,
            "Saved subtitle to {}",
            target.display()
        );
        self.refresh_media_servers(video_path).await;
        Ok(())
    }

    /// Best effort: a failed refresh never fails the item.
    async fn refresh_media_servers(&self, video_path: &Path) {
        for server in &self.media_servers {
            if let Err(e) = server.refresh_item(video_path).await {
                tracing::debug!("Media server refresh failed: {e}");
            }
        }
    }

    /// Pick the input for the translation fallback: either an acceptable
    /// provider candidate in another language (downloaded first as its own
    /// sidecar) or an existing sidecar on disk.
    async fn translation_source(
        &self,
        item: &WantedItem,
        ranked: &[ScoredCandidate],
        kind: SubtitleKind,
        accept: &(dyn Fn(&ScoredCandidate) -> bool + Sync),
    ) -> Result<Option<(std::path::PathBuf, String)>, AppError> {
        if let Some(best_other) = ranked.iter().find(|s| {
            !s.candidate
                .language
                .eq_ignore_ascii_case(&item.target_language)
                && accept(s)
        }) {
            let candidate = &best_other.candidate;
            let bytes = self.download_with_retry(candidate).await?;
            let subs = Subtitles::parse_bytes(&bytes).map_err(|e| {
                AppError::content_invalid(format!("fallback subtitle invalid: {e}"))
            })?;
            let video_path = Path::new(&item.file_path);
            let source_path =
                SubtitlePath::render(video_path, &candidate.language, kind, subs.format);
            backup_file(&source_path).await?;
            tokio::fs::write(&source_path, subs.serialize(subs.format)).await?;
            return Ok(Some((source_path, candidate.language.clone())));
        }

        let video_path = Path::new(&item.file_path);
        let observed = observed_subtitles(video_path, &[]);
        Ok(observed
            .into_iter()
            .find(|o| o.kind == kind && !o.language.eq_ignore_ascii_case(&item.target_language))
            .map(|o| {
                let language = o.language.clone();
                (o.path, language)
            }))
    }

    async fn translate_and_save(
        &self,
        item: &WantedItem,
        (source_path, source_lang): (std::path::PathBuf, String),
        kind: SubtitleKind,
    ) -> Result<(), AppError> {
        let video_path = Path::new(&item.file_path);
        self.events.publish(Event::TranslationStarted {
            file_path: item.file_path.clone(),
            source_lang: source_lang.clone(),
            target_lang: item.target_language.clone(),
        });
        let (target_path, outcome) = self
            .translator
            .translate_file(
                &source_path,
                video_path,
                &source_lang,
                &item.target_language,
                kind,
                None,
            )
            .await?;

        if !outcome.fully_translated() {
            self.events.publish(Event::TranslationFailed {
                file_path: item.file_path.clone(),
                target_lang: item.target_language.clone(),
                reason: format!("{} batches failed", outcome.failed_batches),
            });
            return Err(AppError::transient("translation backend failed"));
        }

        let size = tokio::fs::metadata(&target_path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        self.db
            .insert_download(
                &item.file_path,
                &item.target_language,
                kind,
                &format!("translation:{}", outcome.backend_name),
                None,
                0,
                size,
                None,
            )
            .await?;
        self.db
            .record_attempt(item.id, WantedStatus::Translated, None)
            .await?;
        self.events.publish(Event::TranslationComplete {
            file_path: item.file_path.clone(),
            target_lang: item.target_language.clone(),
            backend: outcome.backend_name.clone(),
            lines: outcome.lines.len(),
            duration_ms: outcome.duration_ms,
        });
        self.refresh_media_servers(video_path).await;
        Ok(())
    }

    /// Transient download errors are retried with exponential backoff and
    /// jitter; permanent errors surface immediately.
    async fn download_with_retry(
        &self,
        candidate: &crate::providers::Candidate,
    ) -> Result<Vec<u8>, AppError> {
        const TRIES: u32 = 3;
        let mut last_error = None;
        for attempt in 0..TRIES {
            if attempt > 0 {
                let jitter = rand::rng().random_range(0..250);
                let backoff = 500u64 * 2u64.pow(attempt - 1) + jitter;
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
            match self.providers.download(candidate).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    let app_error = classify_provider_error(e);
                    if !app_error.is_transient() {
                        return Err(app_error);
                    }
                    last_error = Some(app_error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::transient("download failed")))
    }

    async fn handle_failure(&self, item: &WantedItem, error: AppError) -> ItemOutcome {
        let max_attempts: config::MaxAttempts = CONFIG.get_value();
        // attempts are bumped by record_attempt below
        let exhausted = item.attempts + 1 >= max_attempts.0 as i64;
        let next_status = if exhausted {
            WantedStatus::Failed
        } else {
            WantedStatus::Wanted
        };
        if let Err(e) = self
            .db
            .record_attempt(item.id, next_status, Some(&error.message))
            .await
        {
            tracing::error!("Failed to record attempt: {e}");
        }
        self.events.publish(Event::SearchFailed {
            title: item.title.clone(),
            language: item.target_language.clone(),
            reason: error.message.clone(),
            provider: None,
        });
        tracing::warn!(
            title = %item.title,
            language = %item.target_language,
            attempts = item.attempts + 1,
            exhausted,
            "Search failed: {}",
            error.message
        );
        ItemOutcome::Failed
    }
}

fn classify_provider_error(error: anyhow::Error) -> AppError {
    if let Some(reqwest_error) = error.downcast_ref::<reqwest::Error>() {
        if reqwest_error.is_timeout() || reqwest_error.is_connect() {
            return AppError::transient(error.to_string());
        }
        if let Some(status) = reqwest_error.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return AppError::transient(error.to_string());
            }
            return AppError::permanent(error.to_string());
        }
    }
    let message = error.to_string();
    if message.contains("circuit is open") {
        AppError::transient(message)
    } else {
        AppError::permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_classification() {
        let circuit = classify_provider_error(anyhow::anyhow!("provider x circuit is open"));
        assert!(circuit.is_transient());
        let plain = classify_provider_error(anyhow::anyhow!("404 not found"));
        assert!(!plain.is_transient());
    }
}
