use std::{
    collections::HashMap,
    path::PathBuf,
    time::Duration,
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{self, CONFIG},
    events::Event,
    standalone::StandaloneSource,
    subtitles::is_video_file,
    wanted::scanner::WantedScanner,
};

/// Seconds between the two size probes of the stability check.
const STABILITY_PROBE_SECS: u64 = 2;

/// Event-driven half of the standalone subsystem: coalesces filesystem
/// events per path, waits for the file to stop growing, then hands it to
/// the standalone scanner.
pub async fn run(
    standalone: &'static StandaloneSource,
    wanted: &'static WantedScanner,
    cancellation: CancellationToken,
    tracker: TaskTracker,
) {
    let folders: config::StandaloneFolders = CONFIG.get_value();
    let roots: Vec<PathBuf> = folders.existing().into_iter().cloned().collect();
    if roots.is_empty() {
        tracing::info!("No standalone folders configured, watcher idle");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let watcher_tx = tx.clone();
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            use notify::EventKind;
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
            ) {
                return;
            }
            for path in event.paths {
                if is_video_file(&path) {
                    let _ = watcher_tx.send(path);
                }
            }
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!("Failed to create filesystem watcher: {e}");
                return;
            }
        };

    for root in &roots {
        if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
            tracing::error!(root = %root.display(), "Failed to watch directory: {e}");
        } else {
            tracing::info!(root = %root.display(), "Watching for new video files");
        }
    }

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            path = rx.recv() => {
                let Some(path) = path else { break };
                let debounce: config::WatcherDebounceSeconds = CONFIG.get_value();
                // bursts of create/modify events collapse into one deadline
                pending.insert(path, Instant::now() + Duration::from_secs(debounce.0));
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    let requeue = tx.clone();
                    let cancellation = cancellation.clone();
                    tracker.spawn(async move {
                        handle_settled(standalone, wanted, path, requeue, cancellation).await;
                    });
                }
            }
            _ = cancellation.cancelled() => break,
        }
    }
    tracing::trace!("Filesystem watcher stopped");
}

/// A file whose debounce expired. Still-growing files go back through the
/// debounce; stable ones are scanned.
async fn handle_settled(
    standalone: &StandaloneSource,
    wanted: &WantedScanner,
    path: PathBuf,
    requeue: mpsc::UnboundedSender<PathBuf>,
    cancellation: CancellationToken,
) {
    let size_before = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata.len(),
        // deleted between debounce and check
        Err(_) => return,
    };
    tokio::time::sleep(Duration::from_secs(STABILITY_PROBE_SECS)).await;
    if cancellation.is_cancelled() {
        return;
    }
    let size_after = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => return,
    };
    if size_after != size_before {
        tracing::debug!(path = %path.display(), "File still growing, rescheduling");
        let _ = requeue.send(path);
        return;
    }

    tracing::info!(path = %path.display(), "New video file settled");
    standalone.events().publish(Event::StandaloneFileDetected {
        file_path: path.to_string_lossy().to_string(),
    });
    if let Err(e) = standalone
        .scan_files(wanted, vec![path.clone()], cancellation)
        .await
    {
        tracing::error!(path = %path.display(), "Scan of detected file failed: {e}");
    }
}
