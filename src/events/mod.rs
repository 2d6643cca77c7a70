use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    adapters::NotificationDelivery,
    config::{self, CONFIG},
    db::Db,
};

pub mod hooks;
pub mod notifications;
pub mod webhooks;

/// The closed event catalog. Every publisher in the system speaks one of
/// these; payload keys are stable because subscribers template over them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SubtitleDownloaded {
        provider: String,
        language: String,
        format: String,
        score: i64,
        title: String,
        season: Option<i64>,
        episode: Option<i64>,
    },
    SubtitleUpgraded {
        provider: String,
        language: String,
        score: i64,
        previous_score: i64,
        title: String,
    },
    SearchStarted {
        items: usize,
    },
    SearchFailed {
        title: String,
        language: String,
        reason: String,
        provider: Option<String>,
    },
    BatchComplete {
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
    },
    TranslationStarted {
        file_path: String,
        source_lang: String,
        target_lang: String,
    },
    TranslationComplete {
        file_path: String,
        target_lang: String,
        backend: String,
        lines: usize,
        duration_ms: u64,
    },
    TranslationFailed {
        file_path: String,
        target_lang: String,
        reason: String,
    },
    WantedItemAdded {
        title: String,
        language: String,
        subtitle_type: String,
    },
    WantedItemRemoved {
        title: String,
        language: String,
        subtitle_type: String,
    },
    ScanStarted {
        instance: String,
    },
    ScanComplete {
        instance: String,
        created: u64,
        updated: u64,
        removed: u64,
        duration_ms: u64,
    },
    ConfigUpdated {
        keys: Vec<String>,
    },
    HealthCheckComplete {
        files: usize,
        average_score: i64,
        duration_ms: u64,
    },
    AutofixApplied {
        file_path: String,
        fixes: Vec<String>,
    },
    DedupScanComplete {
        files_hashed: usize,
        duplicate_groups: usize,
    },
    DuplicatesDeleted {
        groups: usize,
        files_removed: usize,
    },
    CleanupRun {
        action: String,
        files_removed: i64,
    },
    StandaloneFileDetected {
        file_path: String,
    },
    ProviderCircuitOpen {
        provider: String,
    },
    BackupComplete {
        path: String,
    },
    Error {
        context: String,
        message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SubtitleDownloaded { .. } => "subtitle_downloaded",
            Event::SubtitleUpgraded { .. } => "upgrade_complete",
            Event::SearchStarted { .. } => "search_started",
            Event::SearchFailed { .. } => "search_failed",
            Event::BatchComplete { .. } => "batch_complete",
            Event::TranslationStarted { .. } => "translation_started",
            Event::TranslationComplete { .. } => "translation_complete",
            Event::TranslationFailed { .. } => "translation_failed",
            Event::WantedItemAdded { .. } => "wanted_item_added",
            Event::WantedItemRemoved { .. } => "wanted_item_removed",
            Event::ScanStarted { .. } => "scan_started",
            Event::ScanComplete { .. } => "scan_complete",
            Event::ConfigUpdated { .. } => "config_updated",
            Event::HealthCheckComplete { .. } => "health_check_complete",
            Event::AutofixApplied { .. } => "autofix_applied",
            Event::DedupScanComplete { .. } => "dedup_scan_complete",
            Event::DuplicatesDeleted { .. } => "duplicates_deleted",
            Event::CleanupRun { .. } => "cleanup_run",
            Event::StandaloneFileDetected { .. } => "standalone_file_detected",
            Event::ProviderCircuitOpen { .. } => "provider_circuit_open",
            Event::BackupComplete { .. } => "backup_complete",
            Event::Error { .. } => "error",
        }
    }

    /// Payload as a JSON object, without the event tag.
    pub fn payload(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut value = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        value.remove("event");
        value
    }
}

/// Publish side of the bus. `publish` returns as soon as the event is
/// enqueued; delivery happens on the dispatcher pool.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A bus with no dispatcher behind it. Events are dropped; used by
    /// one-shot CLI runs and tests that don't observe delivery.
    pub fn sink() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.name(), "Publishing event");
        if self.tx.send(event).is_err() {
            tracing::warn!("Event dispatcher is gone, dropping event");
        }
    }
}

/// Delivery side: fans events out to hook, webhook and notification
/// subscribers on a bounded worker pool. At-least-once, unordered across
/// subscribers; subscriber errors never reach publishers.
pub struct EventDispatcher {
    rx: mpsc::UnboundedReceiver<Event>,
    db: &'static Db,
    deliveries: Vec<Arc<dyn NotificationDelivery>>,
    client: reqwest::Client,
}

impl EventDispatcher {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Event>,
        db: &'static Db,
        deliveries: Vec<Arc<dyn NotificationDelivery>>,
    ) -> Self {
        Self {
            rx,
            db,
            deliveries,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(mut self, cancellation_token: CancellationToken, tracker: TaskTracker) {
        let workers: config::DispatcherWorkers = CONFIG.get_value();
        let semaphore = Arc::new(Semaphore::new(workers.0.max(1)));
        loop {
            let event = tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = cancellation_token.cancelled() => break,
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let db = self.db;
            let deliveries = self.deliveries.clone();
            let client = self.client.clone();
            tracker.spawn(async move {
                let _permit = permit;
                hooks::dispatch(db, &event).await;
                webhooks::dispatch(db, &client, &event).await;
                notifications::dispatch(db, &deliveries, &event).await;
            });
        }
        tracing::trace!("Event dispatcher drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_the_tag_and_keeps_fields() {
        let event = Event::SubtitleDownloaded {
            provider: "opensubtitles".into(),
            language: "en".into(),
            format: "srt".into(),
            score: 75,
            title: "Show".into(),
            season: Some(1),
            episode: Some(2),
        };
        assert_eq!(event.name(), "subtitle_downloaded");
        let payload = event.payload();
        assert!(payload.get("event").is_none());
        assert_eq!(payload["provider"], "opensubtitles");
        assert_eq!(payload["score"], 75);
    }

    #[tokio::test]
    async fn publish_enqueues_without_blocking() {
        let (bus, mut rx) = EventBus::channel();
        bus.publish(Event::ScanStarted {
            instance: "standalone".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "scan_started");
    }
}
