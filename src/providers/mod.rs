use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    config::{self, CONFIG},
    subtitles::{SubtitleFormat, SubtitleKind},
};

pub mod scorer;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoQuery {
    pub title: String,
    pub year: Option<i64>,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub languages: Vec<String>,
    pub subtitle_type: Option<SubtitleKind>,
    pub release_group: Option<String>,
    pub resolution: Option<String>,
    /// Opensubtitles-style moviehash of the video file.
    pub source_hash: Option<String>,
    pub forced_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub provider_name: String,
    pub external_id: String,
    pub language: String,
    pub release_group: Option<String>,
    pub format: Option<SubtitleFormat>,
    pub file_name: Option<String>,
    pub year: Option<i64>,
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub foreign_parts_only: bool,
    #[serde(default)]
    pub hearing_impaired: bool,
    #[serde(default)]
    pub matched_by_hash: bool,
    /// Free-form provider metadata (stream title, uploader notes, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcedConfidence {
    NotForced,
    Single,
    Corroborated,
}

/// Classify whether a candidate is a forced/signs track. Signals in priority
/// order: provider disposition flag, file-name pattern, metadata markers.
/// Two agreeing signals promote confidence.
pub fn classify_forced(candidate: &Candidate, extra_patterns: &[Regex]) -> ForcedConfidence {
    let mut signals = 0u32;
    if candidate.foreign_parts_only {
        signals += 1;
    }
    let name = candidate
        .file_name
        .as_deref()
        .unwrap_or(&candidate.external_id)
        .to_lowercase();
    let filename_forced = name.contains(".forced.")
        || name.contains("forced")
        || extra_patterns.iter().any(|p| p.is_match(&name));
    if filename_forced {
        signals += 1;
    }
    let marker = candidate.metadata.values().any(|v| {
        let v = v.to_lowercase();
        v.contains("signs & songs") || v.contains("signs and songs") || v.contains("forced")
    });
    if marker {
        signals += 1;
    }
    match signals {
        0 => ForcedConfidence::NotForced,
        1 => ForcedConfidence::Single,
        _ => ForcedConfidence::Corroborated,
    }
}

impl Candidate {
    pub fn kind(&self, extra_patterns: &[Regex]) -> SubtitleKind {
        match classify_forced(self, extra_patterns) {
            ForcedConfidence::NotForced => SubtitleKind::Full,
            _ => SubtitleKind::Forced,
        }
    }
}

/// A subtitle source. Wire formats are the implementation's concern; the
/// registry only sees this contract.
#[async_trait]
pub trait SubtitleProvider: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    async fn search(&self, query: &VideoQuery) -> anyhow::Result<Vec<Candidate>>;
    async fn download(&self, candidate: &Candidate) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-provider circuit breaker: three consecutive failures open the
/// circuit for a cooldown window. After the window a single probe is let
/// through; one more failure re-opens immediately.
#[derive(Debug)]
pub struct CircuitBreaker {
    states: Mutex<HashMap<String, BreakerState>>,
    threshold: u32,
}

pub const BREAKER_THRESHOLD: u32 = 3;

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold: BREAKER_THRESHOLD,
        }
    }

    fn cooldown(&self) -> Duration {
        let cooldown: config::CircuitBreakerCooldownSeconds = CONFIG.get_value();
        Duration::from_secs(cooldown.0)
    }

    pub fn allows(&self, provider: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(provider) else {
            return true;
        };
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // half-open probe
                state.open_until = None;
                state.consecutive_failures = self.threshold - 1;
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.lock().unwrap();
        states.remove(provider);
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&self, provider: &str) -> bool {
        let cooldown = self.cooldown();
        let mut states = self.states.lock().unwrap();
        let state = states.entry(provider.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + cooldown);
            true
        } else {
            false
        }
    }

    pub fn open_providers(&self) -> Vec<String> {
        let states = self.states.lock().unwrap();
        let now = Instant::now();
        states
            .iter()
            .filter(|(_, s)| s.open_until.map(|u| now < u).unwrap_or(false))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub candidates: Vec<Candidate>,
    /// Providers that errored this round, with the error message.
    pub provider_errors: Vec<(String, String)>,
    /// Providers whose circuit opened as a result of this round.
    pub circuits_opened: Vec<String>,
    /// Providers skipped because their circuit was already open.
    pub skipped_open: Vec<String>,
}

pub struct ProviderRegistry {
    providers: Mutex<Vec<Arc<dyn SubtitleProvider>>>,
    pub breaker: CircuitBreaker,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self
            .providers
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            breaker: CircuitBreaker::new(),
        }
    }

    pub fn register(&self, provider: Arc<dyn SubtitleProvider>) {
        self.providers.lock().unwrap().push(provider);
    }

    /// Registered providers filtered down to the configured enabled set.
    pub fn enabled(&self) -> Vec<Arc<dyn SubtitleProvider>> {
        let enabled: config::EnabledProviders = CONFIG.get_value();
        let providers = self.providers.lock().unwrap().clone();
        if enabled.0.is_empty() {
            return providers;
        }
        providers
            .into_iter()
            .filter(|p| enabled.0.iter().any(|name| name == p.name()))
            .collect()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn priorities(&self) -> HashMap<String, i32> {
        self.providers
            .lock()
            .unwrap()
            .iter()
            .map(|p| (p.name().to_string(), p.priority()))
            .collect()
    }

    fn find(&self, name: &str) -> Option<Arc<dyn SubtitleProvider>> {
        self.providers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Fan out a search across enabled providers, bounded by
    /// `min(4, providers)`. Per-provider failures are isolated and recorded
    /// against the circuit breaker; they never abort the batch.
    pub async fn search_all(&self, query: &VideoQuery) -> SearchOutcome {
        let providers = self.enabled();
        let mut outcome = SearchOutcome::default();
        if providers.is_empty() {
            return outcome;
        }
        let semaphore = Arc::new(Semaphore::new(providers.len().min(4)));
        let mut handles = Vec::with_capacity(providers.len());
        for provider in providers {
            if !self.breaker.allows(provider.name()) {
                outcome.skipped_open.push(provider.name().to_string());
                continue;
            }
            let semaphore = semaphore.clone();
            let query = query.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let name = provider.name().to_string();
                (name, provider.search(&query).await)
            }));
        }
        for handle in handles {
            match handle.await {
                Ok((name, Ok(candidates))) => {
                    self.breaker.record_success(&name);
                    outcome.candidates.extend(candidates);
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(provider = %name, "Provider search failed: {e}");
                    if self.breaker.record_failure(&name) {
                        outcome.circuits_opened.push(name.clone());
                    }
                    outcome.provider_errors.push((name, e.to_string()));
                }
                Err(e) => tracing::error!("Provider search task panicked: {e}"),
            }
        }
        outcome
    }

    pub async fn download(&self, candidate: &Candidate) -> anyhow::Result<Vec<u8>> {
        let provider = self
            .find(&candidate.provider_name)
            .ok_or_else(|| anyhow::anyhow!("provider {} not registered", candidate.provider_name))?;
        if !self.breaker.allows(provider.name()) {
            anyhow::bail!("provider {} circuit is open", provider.name());
        }
        match provider.download(candidate).await {
            Ok(bytes) => {
                self.breaker.record_success(provider.name());
                Ok(bytes)
            }
            Err(e) => {
                self.breaker.record_failure(provider.name());
                Err(e)
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile the configured extra forced-filename patterns; invalid regexes
/// are dropped with a warning.
pub fn forced_patterns() -> Vec<Regex> {
    let configured: config::ForcedFilenamePatterns = CONFIG.get_value();
    configured
        .0
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(pattern = %p, "Invalid forced filename pattern: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            provider_name: "test".into(),
            external_id: "1".into(),
            language: "en".into(),
            release_group: None,
            format: Some(SubtitleFormat::Srt),
            file_name: Some(name.into()),
            year: None,
            size_bytes: None,
            foreign_parts_only: false,
            hearing_impaired: false,
            matched_by_hash: false,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn forced_classification_signals() {
        let plain = candidate("Show.S01E02.en.srt");
        assert_eq!(classify_forced(&plain, &[]), ForcedConfidence::NotForced);

        let by_name = candidate("Show.S01E02.en.forced.srt");
        assert_eq!(classify_forced(&by_name, &[]), ForcedConfidence::Single);

        let mut corroborated = candidate("Show.S01E02.en.forced.srt");
        corroborated.foreign_parts_only = true;
        assert_eq!(
            classify_forced(&corroborated, &[]),
            ForcedConfidence::Corroborated
        );

        let mut marker = candidate("Show.S01E02.en.srt");
        marker
            .metadata
            .insert("notes".into(), "Signs & Songs only".into());
        assert_eq!(classify_forced(&marker, &[]), ForcedConfidence::Single);
        assert_eq!(marker.kind(&[]), SubtitleKind::Forced);
    }

    #[test]
    fn breaker_opens_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.allows("x"));
        assert!(!breaker.record_failure("x"));
        assert!(!breaker.record_failure("x"));
        assert!(breaker.record_failure("x"));
        assert!(!breaker.allows("x"));
        assert_eq!(breaker.open_providers(), vec!["x".to_string()]);

        // success elsewhere does not affect x
        breaker.record_success("y");
        assert!(!breaker.allows("x"));
    }

    #[test]
    fn breaker_resets_on_success() {
        let breaker = CircuitBreaker::new();
        breaker.record_failure("x");
        breaker.record_failure("x");
        breaker.record_success("x");
        assert!(!breaker.record_failure("x"));
        assert!(breaker.allows("x"));
    }
}
