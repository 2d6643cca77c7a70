use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    app_state::AppError,
    config::{self, CONFIG},
    subtitles::{SubtitleKind, SubtitlePath, Subtitles},
};

pub mod memory;
pub mod openai;

use memory::TranslationMemory;

pub const MEMORY_BACKEND_NAME: &str = "translation_memory";

/// Inviolable glossary markers. Substituted terms are wrapped before the
/// batch goes to the backend and unwrapped afterwards; backends are
/// instructed to keep the wrapped spans untouched.
const MARKER_OPEN: char = '⟦';
const MARKER_CLOSE: char = '⟧';

#[async_trait]
pub trait TranslationBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Translate a batch, returning exactly one output line per input line.
    async fn translate(
        &self,
        lines: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub lines: Vec<String>,
    pub backend_name: String,
    pub cached_lines: usize,
    pub failed_batches: usize,
    pub duration_ms: u64,
}

impl TranslationOutcome {
    pub fn fully_translated(&self) -> bool {
        self.failed_batches == 0
    }
}

pub struct Translator {
    backends: Mutex<Vec<Arc<dyn TranslationBackend>>>,
    memory: &'static TranslationMemory,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self
            .backends
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        f.debug_struct("Translator").field("backends", &names).finish()
    }
}

impl Translator {
    pub fn new(memory: &'static TranslationMemory) -> Self {
        Self {
            backends: Mutex::new(Vec::new()),
            memory,
        }
    }

    pub fn register(&self, backend: Arc<dyn TranslationBackend>) {
        self.backends.lock().unwrap().push(backend);
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    fn backend(&self, name: Option<&str>) -> Result<Arc<dyn TranslationBackend>, AppError> {
        let selected: config::TranslationBackendName = CONFIG.get_value();
        let wanted = name.unwrap_or(&selected.0);
        self.backends
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.name() == wanted)
            .cloned()
            .ok_or_else(|| {
                AppError::configuration(format!("translation backend {wanted} is not registered"))
            })
    }

    /// Translate an ordered list of lines. Cached lines are served from the
    /// translation memory; the rest is batched to the selected backend and
    /// merged back in input order. A failed batch leaves its lines empty —
    /// cached lines are still emitted.
    pub async fn translate_lines(
        &self,
        lines: &[String],
        source_lang: &str,
        target_lang: &str,
        backend_name: Option<&str>,
    ) -> Result<TranslationOutcome, AppError> {
        let started = Instant::now();
        let threshold: config::TmSimilarityThreshold = CONFIG.get_value();
        let batch_size: config::TranslationBatchSize = CONFIG.get_value();
        let workers: config::TranslationWorkers = CONFIG.get_value();
        let glossary: config::Glossary = CONFIG.get_value();

        let mut output: Vec<Option<String>> = vec![None; lines.len()];
        let mut misses: Vec<usize> = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            match self
                .memory
                .lookup(source_lang, target_lang, line, threshold.0)
                .await
            {
                Some(hit) => output[index] = Some(hit.translated_text),
                None => misses.push(index),
            }
        }
        let cached_lines = lines.len() - misses.len();

        if misses.is_empty() {
            return Ok(TranslationOutcome {
                lines: output.into_iter().map(|l| l.unwrap_or_default()).collect(),
                backend_name: MEMORY_BACKEND_NAME.to_string(),
                cached_lines,
                failed_batches: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let backend = self.backend(backend_name)?;
        let semaphore = Arc::new(Semaphore::new(workers.0.max(1)));
        let mut handles = Vec::new();
        for batch_indices in misses.chunks(batch_size.0.max(1)) {
            let batch_indices: Vec<usize> = batch_indices.to_vec();
            let batch: Vec<String> = batch_indices
                .iter()
                .map(|&i| apply_glossary(&lines[i], &glossary.0))
                .collect();
            let backend = backend.clone();
            let semaphore = semaphore.clone();
            let source = source_lang.to_string();
            let target = target_lang.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = backend.translate(&batch, &source, &target).await;
                (batch_indices, result)
            }));
        }

        let mut failed_batches = 0usize;
        for handle in handles {
            let Ok((batch_indices, result)) = handle.await else {
                failed_batches += 1;
                continue;
            };
            match result {
                Ok(translated) if translated.len() == batch_indices.len() => {
                    for (&index, line) in batch_indices.iter().zip(translated.iter()) {
                        let line = strip_markers(line);
                        self.memory
                            .store(source_lang, target_lang, &lines[index], &line)
                            .await;
                        output[index] = Some(line);
                    }
                }
                Ok(translated) => {
                    tracing::warn!(
                        expected = batch_indices.len(),
                        got = translated.len(),
                        "Backend returned a mismatched batch, marking failed"
                    );
                    failed_batches += 1;
                }
                Err(e) => {
                    tracing::warn!("Translation batch failed: {e}");
                    failed_batches += 1;
                }
            }
        }

        Ok(TranslationOutcome {
            lines: output.into_iter().map(|l| l.unwrap_or_default()).collect(),
            backend_name: backend.name().to_string(),
            cached_lines,
            failed_batches,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Translate a subtitle file and write the result as a sidecar of the
    /// video in the target language. Timing and styling carry over; only
    /// event text changes.
    pub async fn translate_file(
        &self,
        subtitle_path: &Path,
        video_path: &Path,
        source_lang: &str,
        target_lang: &str,
        kind: SubtitleKind,
        backend_name: Option<&str>,
    ) -> Result<(PathBuf, TranslationOutcome), AppError> {
        let mut subs = Subtitles::parse_file(subtitle_path)?;
        let lines: Vec<String> = subs.events.iter().map(|e| e.text.clone()).collect();
        let outcome = self
            .translate_lines(&lines, source_lang, target_lang, backend_name)
            .await?;
        for (event, translated) in subs.events.iter_mut().zip(outcome.lines.iter()) {
            if !translated.is_empty() {
                event.text = translated.clone();
            }
        }
        let format = subs.format;
        let target_path = SubtitlePath::render(video_path, target_lang, kind, format);
        crate::health::backup_file(&target_path).await?;
        tokio::fs::write(&target_path, subs.serialize(format)).await?;
        Ok((target_path, outcome))
    }
}

/// Replace glossary source terms with their targets, wrapped in markers the
/// backend must preserve.
fn apply_glossary(line: &str, glossary: &std::collections::HashMap<String, String>) -> String {
    let mut out = line.to_string();
    for (source_term, target_term) in glossary {
        if source_term.is_empty() {
            continue;
        }
        if out.contains(source_term.as_str()) {
            out = out.replace(
                source_term.as_str(),
                &format!("{MARKER_OPEN}{target_term}{MARKER_CLOSE}"),
            );
        }
    }
    out
}

fn strip_markers(line: &str) -> String {
    line.chars()
        .filter(|c| *c != MARKER_OPEN && *c != MARKER_CLOSE)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UppercaseBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranslationBackend for UppercaseBackend {
        fn name(&self) -> &str {
            "openai"
        }
        async fn translate(
            &self,
            lines: &[String],
            _source_lang: &str,
            _target_lang: &str,
        ) -> anyhow::Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(lines.iter().map(|l| l.to_uppercase()).collect())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl TranslationBackend for FailingBackend {
        fn name(&self) -> &str {
            "openai"
        }
        async fn translate(
            &self,
            _lines: &[String],
            _source_lang: &str,
            _target_lang: &str,
        ) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("backend exploded")
        }
    }

    async fn translator_with(backend: Arc<dyn TranslationBackend>) -> Translator {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db: &'static Db = Box::leak(Box::new(db));
        let memory: &'static TranslationMemory =
            Box::leak(Box::new(TranslationMemory::new(db)));
        let translator = Translator::new(memory);
        translator.register(backend);
        translator
    }

    #[tokio::test]
    async fn order_is_preserved_through_batches() {
        let translator = translator_with(Arc::new(UppercaseBackend {
            calls: AtomicUsize::new(0),
        }))
        .await;
        let lines: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        let outcome = translator
            .translate_lines(&lines, "en", "de", None)
            .await
            .unwrap();
        assert_eq!(outcome.lines.len(), lines.len());
        for (i, line) in outcome.lines.iter().enumerate() {
            assert_eq!(line, &format!("LINE {i}"));
        }
        assert_eq!(outcome.failed_batches, 0);
    }

    #[tokio::test]
    async fn full_cache_short_circuits_the_backend() {
        let backend = Arc::new(UppercaseBackend {
            calls: AtomicUsize::new(0),
        });
        let translator = translator_with(backend.clone()).await;
        let lines = vec!["hello".to_string(), "world".to_string()];
        let first = translator
            .translate_lines(&lines, "en", "de", None)
            .await
            .unwrap();
        assert_eq!(first.backend_name, "openai");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let second = translator
            .translate_lines(&lines, "en", "de", None)
            .await
            .unwrap();
        assert_eq!(second.backend_name, MEMORY_BACKEND_NAME);
        assert_eq!(second.cached_lines, 2);
        assert_eq!(second.lines, vec!["HELLO", "WORLD"]);
        // no extra backend call
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_batches_yield_empty_strings_but_keep_cache_hits() {
        let ok = translator_with(Arc::new(UppercaseBackend {
            calls: AtomicUsize::new(0),
        }))
        .await;
        let cached = vec!["hello".to_string()];
        ok.translate_lines(&cached, "en", "de", None).await.unwrap();

        // same memory is not shared between translators, so warm the failing
        // one through its own memory store
        let failing = translator_with(Arc::new(FailingBackend)).await;
        failing
            .memory
            .store("en", "de", "hello", "HELLO")
            .await;
        let lines = vec!["hello".to_string(), "brand new line".to_string()];
        let outcome = failing
            .translate_lines(&lines, "en", "de", None)
            .await
            .unwrap();
        assert_eq!(outcome.lines[0], "HELLO");
        assert_eq!(outcome.lines[1], "");
        assert_eq!(outcome.failed_batches, 1);
        assert!(!outcome.fully_translated());
    }

    #[test]
    fn glossary_wraps_and_strip_removes() {
        let mut glossary = std::collections::HashMap::new();
        glossary.insert("Tokyo".to_string(), "Tokio".to_string());
        let substituted = apply_glossary("Welcome to Tokyo!", &glossary);
        assert_eq!(substituted, "Welcome to ⟦Tokio⟧!");
        assert_eq!(strip_markers(&substituted), "Welcome to Tokio!");
    }
}
