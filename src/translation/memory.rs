use crate::{db::Db, utils::sha256_hex};

/// Normalization applied before hashing: strip outer whitespace, lower-case,
/// collapse internal whitespace runs to a single space. Lookup and store
/// must agree on this bit-exactly.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    out
}

pub fn text_hash(normalized: &str) -> String {
    sha256_hex(normalized.as_bytes())
}

/// Similarity of two normalized strings via longest common subsequence:
/// `2 * lcs / (|a| + |b|)`.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            current[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(current[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut current);
    }
    let lcs = prev[b.len()] as f64;
    2.0 * lcs / (a.len() + b.len()) as f64
}

/// Fuzzy scans are bounded to the newest candidates of a language pair so a
/// large memory cannot stall a lookup.
const FUZZY_SCAN_LIMIT: i64 = 2000;

#[derive(Debug)]
pub struct TranslationMemory {
    db: &'static Db,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TmHit {
    pub translated_text: String,
    pub exact: bool,
}

impl TranslationMemory {
    pub fn new(db: &'static Db) -> Self {
        Self { db }
    }

    /// Exact lookup by hash; below `similarity_threshold < 1.0` a bounded
    /// similarity scan over the language pair follows a miss. Fails open:
    /// any store error reads as a miss.
    pub async fn lookup(
        &self,
        source_lang: &str,
        target_lang: &str,
        text: &str,
        similarity_threshold: f64,
    ) -> Option<TmHit> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }
        let hash = text_hash(&normalized);
        match self.db.tm_lookup_exact(source_lang, target_lang, &hash).await {
            Ok(Some(entry)) => {
                return Some(TmHit {
                    translated_text: entry.translated_text,
                    exact: true,
                })
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("Translation memory lookup failed, treating as miss: {e}");
                return None;
            }
        }
        if similarity_threshold >= 1.0 {
            return None;
        }
        let candidates = match self
            .db
            .tm_candidates(source_lang, target_lang, FUZZY_SCAN_LIMIT)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!("Translation memory scan failed, treating as miss: {e}");
                return None;
            }
        };
        let mut best: Option<(f64, String)> = None;
        for candidate in candidates {
            let ratio = lcs_ratio(&normalized, &candidate.normalized_source_text);
            if ratio >= similarity_threshold
                && best.as_ref().map(|(b, _)| ratio > *b).unwrap_or(true)
            {
                best = Some((ratio, candidate.translated_text));
            }
        }
        best.map(|(_, translated_text)| TmHit {
            translated_text,
            exact: false,
        })
    }

    /// Upsert a pair. Empty source lines are never stored. Fails open:
    /// write errors are logged at debug and dropped.
    pub async fn store(
        &self,
        source_lang: &str,
        target_lang: &str,
        text: &str,
        translated: &str,
    ) {
        let normalized = normalize(text);
        if normalized.is_empty() || translated.is_empty() {
            return;
        }
        let hash = text_hash(&normalized);
        if let Err(e) = self
            .db
            .tm_upsert(source_lang, target_lang, &normalized, &hash, translated)
            .await
        {
            tracing::debug!("Translation memory store failed, dropping write: {e}");
        }
    }

    pub async fn stats(&self) -> Result<crate::db::TmStats, sqlx::Error> {
        self.db.tm_stats().await
    }

    pub async fn clear(&self) -> Result<u64, sqlx::Error> {
        self.db.tm_clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn normalization_is_idempotent_and_collapsing() {
        assert_eq!(normalize("  Hello   World \n"), "hello world");
        assert_eq!(normalize(normalize("  Hello   World ").as_str()), "hello world");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("  \t \n"), "");
    }

    #[test]
    fn equal_normalizations_hash_equal() {
        assert_eq!(
            text_hash(&normalize("Hello  World")),
            text_hash(&normalize("  hello world\n"))
        );
        assert_ne!(
            text_hash(&normalize("hello world")),
            text_hash(&normalize("hello worlds"))
        );
    }

    #[test]
    fn lcs_ratio_bounds() {
        assert_eq!(lcs_ratio("abc", "abc"), 1.0);
        assert_eq!(lcs_ratio("abc", "xyz"), 0.0);
        let ratio = lcs_ratio("hello world", "hello there world");
        assert!(ratio > 0.7 && ratio < 1.0);
    }

    async fn memory() -> TranslationMemory {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        let db: &'static Db = Box::leak(Box::new(db));
        TranslationMemory::new(db)
    }

    #[tokio::test]
    async fn store_then_exact_lookup() {
        let tm = memory().await;
        tm.store("en", "de", "Hello World", "Hallo Welt").await;
        let hit = tm.lookup("en", "de", "  hello   world ", 1.0).await.unwrap();
        assert_eq!(hit.translated_text, "Hallo Welt");
        assert!(hit.exact);
    }

    #[tokio::test]
    async fn empty_text_is_a_miss_and_never_stored() {
        let tm = memory().await;
        tm.store("en", "de", "   ", "something").await;
        assert!(tm.lookup("en", "de", "", 1.0).await.is_none());
        assert_eq!(tm.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn fuzzy_lookup_below_threshold_one() {
        let tm = memory().await;
        tm.store("en", "de", "I am going home now", "Ich gehe jetzt nach Hause")
            .await;
        assert!(tm
            .lookup("en", "de", "I am going home", 1.0)
            .await
            .is_none());
        let hit = tm
            .lookup("en", "de", "I am going home", 0.8)
            .await
            .unwrap();
        assert!(!hit.exact);
        assert_eq!(hit.translated_text, "Ich gehe jetzt nach Hause");
    }
}
