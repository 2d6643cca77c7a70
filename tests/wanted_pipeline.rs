use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sublarr::{
    db::{Db, ItemKind, WantedStatus},
    events::EventBus,
    providers::{Candidate, ProviderRegistry, SubtitleProvider, VideoQuery},
    subtitles::SubtitleFormat,
    translation::{memory::TranslationMemory, TranslationBackend, Translator},
    wanted::{scanner::WantedScanner, searcher::WantedSearcher, MediaFile},
};

const SAMPLE_SRT: &str = "1\n00:00:01,000 --> 00:00:03,000\nHello there\n\n2\n00:00:04,000 --> 00:00:06,000\nSecond line\n\n";

struct StaticProvider {
    name: &'static str,
    priority: i32,
    candidates: Vec<Candidate>,
}

#[async_trait]
impl SubtitleProvider for StaticProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn search(&self, _query: &VideoQuery) -> anyhow::Result<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }

    async fn download(&self, _candidate: &Candidate) -> anyhow::Result<Vec<u8>> {
        Ok(SAMPLE_SRT.as_bytes().to_vec())
    }
}

struct EchoBackend;

#[async_trait]
impl TranslationBackend for EchoBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn translate(
        &self,
        lines: &[String],
        _source_lang: &str,
        _target_lang: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(lines.to_vec())
    }
}

fn candidate(provider: &str, id: &str, language: &str, size: i64) -> Candidate {
    Candidate {
        provider_name: provider.to_string(),
        external_id: id.to_string(),
        language: language.to_string(),
        release_group: None,
        format: Some(SubtitleFormat::Srt),
        file_name: Some(format!("Show.S01E02.{language}.srt")),
        year: None,
        size_bytes: Some(size),
        foreign_parts_only: false,
        hearing_impaired: false,
        matched_by_hash: false,
        metadata: HashMap::new(),
    }
}

struct Harness {
    db: &'static Db,
    events_rx: tokio::sync::mpsc::UnboundedReceiver<sublarr::events::Event>,
    scanner: &'static WantedScanner,
    searcher: &'static WantedSearcher,
    providers: &'static ProviderRegistry,
}

async fn harness() -> Harness {
    let db = Db::connect_memory().await.unwrap();
    db.migrate().await.unwrap();
    let db: &'static Db = Box::leak(Box::new(db));

    let (events, events_rx) = EventBus::channel();
    let memory: &'static TranslationMemory = Box::leak(Box::new(TranslationMemory::new(db)));
    let translator: &'static Translator = {
        let translator = Translator::new(memory);
        translator.register(Arc::new(EchoBackend));
        Box::leak(Box::new(translator))
    };
    let providers: &'static ProviderRegistry = Box::leak(Box::new(ProviderRegistry::new()));
    let scanner: &'static WantedScanner = Box::leak(Box::new(WantedScanner::new(db, events.clone())));
    let searcher: &'static WantedSearcher = Box::leak(Box::new(WantedSearcher::new(
        db, providers, translator, events,
    )));
    Harness {
        db,
        events_rx,
        scanner,
        searcher,
        providers,
    }
}

fn media_file(path: PathBuf) -> MediaFile {
    MediaFile {
        item_kind: ItemKind::Episode,
        source_ref: "test:series:1".to_string(),
        instance_name: "test".to_string(),
        title: "Show".to_string(),
        season: Some(1),
        episode: Some(2),
        year: None,
        path,
        existing_subs: Vec::new(),
        embedded_streams: Vec::new(),
    }
}

fn drain_event_names(rx: &mut tokio::sync::mpsc::UnboundedReceiver<sublarr::events::Event>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

#[tokio::test]
async fn missing_subtitle_is_wanted_then_downloaded() {
    let mut h = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("Show.S01E02.mkv");
    std::fs::write(&video, b"").unwrap();

    // provider B's candidate fails the size-sanity check, so A wins
    h.providers.register(Arc::new(StaticProvider {
        name: "provider-a",
        priority: 10,
        candidates: vec![candidate("provider-a", "a-1", "en", 40_000)],
    }));
    h.providers.register(Arc::new(StaticProvider {
        name: "provider-b",
        priority: 1,
        candidates: vec![candidate("provider-b", "b-1", "en", 10)],
    }));

    let stats = h
        .scanner
        .reconcile(
            vec![media_file(video.clone())],
            Some("test"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(stats.created, 1);

    let items = h.db.wanted_for_path(&video.to_string_lossy()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, WantedStatus::Wanted);
    assert_eq!(items[0].target_language, "en");
    assert_eq!(items[0].subtitle_type, "full");

    let batch = h.searcher.search_batch(CancellationToken::new()).await.unwrap();
    assert_eq!(batch.total, 1);
    assert_eq!(batch.succeeded, 1);

    // winner saved to the canonical sidecar path
    let sidecar = dir.path().join("Show.S01E02.en.srt");
    assert!(sidecar.exists());
    let content = std::fs::read_to_string(&sidecar).unwrap();
    assert!(content.contains("Hello there"));

    let item = h.db.get_wanted(items[0].id).await.unwrap();
    assert_eq!(item.status, WantedStatus::Downloaded);

    let downloads = h.db.list_downloads(10).await.unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].provider, "provider-a");

    let names = drain_event_names(&mut h.events_rx);
    assert!(names.contains(&"wanted_item_added"));
    assert!(names.contains(&"subtitle_downloaded"));
    assert!(names.contains(&"batch_complete"));
}

#[tokio::test]
async fn forced_and_full_tracks_are_independent_items() {
    let mut h = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("Show.S01E02.mkv");
    std::fs::write(&video, b"").unwrap();

    let profile_id = h
        .db
        .upsert_profile(
            "forced-separate",
            r#"[{"code":"en","enabled":true,"hearing_impaired":false,"forced_preference":"separate"}]"#,
            60,
            80,
        )
        .await
        .unwrap();
    h.db.assign_profile("test:series:1", profile_id).await.unwrap();

    let mut forced = candidate("provider-a", "forced-1", "en", 9_000);
    forced.foreign_parts_only = true;
    forced.file_name = Some("Show.S01E02.en.forced.srt".to_string());
    h.providers.register(Arc::new(StaticProvider {
        name: "provider-a",
        priority: 0,
        candidates: vec![candidate("provider-a", "full-1", "en", 40_000), forced],
    }));

    let stats = h
        .scanner
        .reconcile(
            vec![media_file(video.clone())],
            Some("test"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(stats.created, 2);

    let batch = h.searcher.search_batch(CancellationToken::new()).await.unwrap();
    assert_eq!(batch.total, 2);
    assert_eq!(batch.succeeded, 2);

    assert!(dir.path().join("Show.S01E02.en.srt").exists());
    assert!(dir.path().join("Show.S01E02.en.forced.srt").exists());

    // a rescan sees both tracks satisfied and clears the queue
    let stats = h
        .scanner
        .reconcile(
            vec![media_file(video.clone())],
            Some("test"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(stats.created, 0);
    let summary = h.db.wanted_summary().await.unwrap();
    assert_eq!(summary.wanted, 0);

    let _ = drain_event_names(&mut h.events_rx);
}

#[tokio::test]
async fn blacklisted_candidates_are_never_admitted() {
    let mut h = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("Other.S01E01.mkv");
    std::fs::write(&video, b"").unwrap();

    h.providers.register(Arc::new(StaticProvider {
        name: "provider-a",
        priority: 0,
        candidates: vec![candidate("provider-a", "bad-1", "en", 40_000)],
    }));
    h.db.blacklist_add("provider-a", "bad-1", Some("broken sync"))
        .await
        .unwrap();

    h.scanner
        .reconcile(
            vec![media_file(video.clone())],
            Some("test"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let batch = h.searcher.search_batch(CancellationToken::new()).await.unwrap();
    assert_eq!(batch.total, 1);
    assert_eq!(batch.succeeded, 0);
    assert_eq!(batch.failed, 1);
    assert!(!dir.path().join("Other.S01E01.en.srt").exists());

    let names = drain_event_names(&mut h.events_rx);
    assert!(names.contains(&"search_failed"));
}
