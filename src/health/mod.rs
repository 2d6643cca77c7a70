use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};

use serde::Serialize;

use crate::{
    app_state::AppError,
    db::Db,
    events::{Event, EventBus},
    subtitles::{SubtitleFormat, Subtitles},
};

pub mod autofix;
pub mod dedup;

/// Health batches are capped per call; larger requests must page.
pub const BATCH_LIMIT: usize = 50;

const EXCESSIVE_DURATION_MS: i64 = 10_000;
const OVERLAP_ERROR_MS: i64 = 500;
const MAX_LINE_LENGTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub check: &'static str,
    pub severity: Severity,
    pub message: String,
    pub event_index: Option<usize>,
}

impl HealthIssue {
    fn new(
        check: &'static str,
        severity: Severity,
        message: impl Into<String>,
        event_index: Option<usize>,
    ) -> Self {
        Self {
            check,
            severity,
            message: message.into(),
            event_index,
        }
    }
}

/// `100 - 10*errors - 3*warnings - 1*infos`, clamped to [0, 100].
pub fn score(issues: &[HealthIssue]) -> i64 {
    let mut score = 100i64;
    for issue in issues {
        score -= match issue.severity {
            Severity::Error => 10,
            Severity::Warning => 3,
            Severity::Info => 1,
        };
    }
    score.clamp(0, 100)
}

/// Run all ten checks over a parsed subtitle document. Pure.
pub fn check_subtitles(subs: &Subtitles) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    duplicate_lines(subs, &mut issues);
    timing_overlaps(subs, &mut issues);
    encoding_issues(subs, &mut issues);
    missing_styles(subs, &mut issues);
    empty_events(subs, &mut issues);
    excessive_duration(subs, &mut issues);
    negative_timing(subs, &mut issues);
    zero_duration(subs, &mut issues);
    line_too_long(subs, &mut issues);
    missing_newlines(subs, &mut issues);
    issues
}

/// Exact text + timing + style duplicates.
fn duplicate_lines(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    let mut seen = HashSet::new();
    for (index, event) in subs.events.iter().enumerate() {
        let key = (
            event.start_ms,
            event.end_ms,
            event.style.clone(),
            event.text.clone(),
        );
        if !seen.insert(key) {
            issues.push(HealthIssue::new(
                "duplicate_lines",
                Severity::Warning,
                format!("event {index} duplicates an earlier event"),
                Some(index),
            ));
        }
    }
}

/// Overlaps within the same style and layer. Short overlaps are common in
/// dialog and only warn; anything past half a second is an error.
fn timing_overlaps(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    let mut by_track: HashMap<(Option<&str>, i32), Vec<(usize, i64, i64)>> = HashMap::new();
    for (index, event) in subs.events.iter().enumerate() {
        by_track
            .entry((event.style.as_deref(), event.layer))
            .or_default()
            .push((index, event.start_ms, event.end_ms));
    }
    for events in by_track.values_mut() {
        events.sort_by_key(|(_, start, _)| *start);
        for pair in events.windows(2) {
            let (_, _, prev_end) = pair[0];
            let (index, start, _) = pair[1];
            let overlap = prev_end - start;
            if overlap > 0 {
                let severity = if overlap < OVERLAP_ERROR_MS {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                issues.push(HealthIssue::new(
                    "timing_overlaps",
                    severity,
                    format!("event {index} overlaps previous event by {overlap} ms"),
                    Some(index),
                ));
            }
        }
    }
}

fn encoding_issues(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    if subs.encoding != "utf-8" {
        issues.push(HealthIssue::new(
            "encoding_issues",
            Severity::Warning,
            format!("file is {} encoded, not UTF-8", subs.encoding),
            None,
        ));
    }
    if subs.had_bom {
        issues.push(HealthIssue::new(
            "encoding_issues",
            Severity::Info,
            "file carries a byte order mark",
            None,
        ));
    }
}

/// ASS events referencing styles the style table does not define.
fn missing_styles(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    if subs.format != SubtitleFormat::Ass {
        return;
    }
    let known: HashSet<&str> = subs.styles.iter().map(|s| s.name.as_str()).collect();
    let mut reported: HashSet<&str> = HashSet::new();
    for event in &subs.events {
        let Some(style) = event.style.as_deref() else {
            continue;
        };
        if !known.contains(style) && reported.insert(style) {
            issues.push(HealthIssue::new(
                "missing_styles",
                Severity::Error,
                format!("style '{style}' is referenced but not defined"),
                None,
            ));
        }
    }
}

fn empty_events(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    for (index, event) in subs.events.iter().enumerate() {
        if event.text.trim().is_empty() {
            issues.push(HealthIssue::new(
                "empty_events",
                Severity::Warning,
                format!("event {index} has no text"),
                Some(index),
            ));
        }
    }
}

fn excessive_duration(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    for (index, event) in subs.events.iter().enumerate() {
        if event.duration_ms() > EXCESSIVE_DURATION_MS {
            issues.push(HealthIssue::new(
                "excessive_duration",
                Severity::Warning,
                format!("event {index} lasts {} ms", event.duration_ms()),
                Some(index),
            ));
        }
    }
}

fn negative_timing(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    for (index, event) in subs.events.iter().enumerate() {
        if event.start_ms < 0 || event.end_ms < 0 || event.end_ms < event.start_ms {
            issues.push(HealthIssue::new(
                "negative_timing",
                Severity::Error,
                format!("event {index} has negative or inverted timing"),
                Some(index),
            ));
        }
    }
}

fn zero_duration(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    for (index, event) in subs.events.iter().enumerate() {
        if event.duration_ms() == 0 && !event.text.trim().is_empty() {
            issues.push(HealthIssue::new(
                "zero_duration",
                Severity::Warning,
                format!("event {index} has zero duration"),
                Some(index),
            ));
        }
    }
}

fn line_too_long(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    for (index, event) in subs.events.iter().enumerate() {
        let too_long = event
            .text
            .split(['\n'])
            .flat_map(|l| l.split("\\N"))
            .any(|line| line.chars().count() > MAX_LINE_LENGTH);
        if too_long {
            issues.push(HealthIssue::new(
                "line_too_long",
                Severity::Info,
                format!("event {index} has a line over {MAX_LINE_LENGTH} characters"),
                Some(index),
            ));
        }
    }
}

/// ASS dialog long enough to need a manual `\N` break but carrying none.
fn missing_newlines(subs: &Subtitles, issues: &mut Vec<HealthIssue>) {
    if subs.format != SubtitleFormat::Ass {
        return;
    }
    for (index, event) in subs.events.iter().enumerate() {
        if event.text.chars().count() > MAX_LINE_LENGTH && !event.text.contains("\\N") {
            issues.push(HealthIssue::new(
                "missing_newlines",
                Severity::Info,
                format!("event {index} is long but has no line break"),
                Some(index),
            ));
        }
    }
}

/// Copy `path` to `path.bak` if it exists. Every file mutation in the
/// system goes through this first.
pub async fn backup_file(path: &Path) -> Result<Option<PathBuf>, AppError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    let backup = PathBuf::from(backup);
    tokio::fs::copy(path, &backup).await?;
    Ok(Some(backup))
}

#[derive(Debug, Clone, Serialize)]
pub struct FileHealthReport {
    pub file_path: String,
    pub score: i64,
    pub issues: Vec<HealthIssue>,
}

#[derive(Debug)]
pub struct HealthEngine {
    db: &'static Db,
    events: EventBus,
}

impl HealthEngine {
    pub fn new(db: &'static Db, events: EventBus) -> Self {
        Self { db, events }
    }

    pub async fn check_file(&self, path: &Path) -> Result<FileHealthReport, AppError> {
        let subs = Subtitles::parse_file(path)?;
        let issues = check_subtitles(&subs);
        let score = score(&issues);
        let report = FileHealthReport {
            file_path: path.to_string_lossy().to_string(),
            score,
            issues,
        };
        let issues_json = serde_json::to_string(&report.issues).unwrap_or_default();
        self.db
            .health_insert(&report.file_path, report.score, &issues_json)
            .await?;
        Ok(report)
    }

    /// Check up to [`BATCH_LIMIT`] files, storing a new result row per file.
    pub async fn check_batch(&self, paths: &[PathBuf]) -> Result<Vec<FileHealthReport>, AppError> {
        let started = Instant::now();
        let mut reports = Vec::new();
        for path in paths.iter().take(BATCH_LIMIT) {
            match self.check_file(path).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Health check failed: {}", e.message)
                }
            }
        }
        let average = if reports.is_empty() {
            0
        } else {
            reports.iter().map(|r| r.score).sum::<i64>() / reports.len() as i64
        };
        self.events.publish(Event::HealthCheckComplete {
            files: reports.len(),
            average_score: average,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(reports)
    }

    /// Scheduled run: sweep the configured roots for subtitle files.
    pub async fn run_scheduled(&self) -> Result<usize, AppError> {
        let paths = dedup::subtitle_files_in_roots()?;
        let mut checked = 0;
        for chunk in paths.chunks(BATCH_LIMIT) {
            checked += self.check_batch(chunk).await?.len();
        }
        Ok(checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitles::{Style, SubtitleEvent};

    fn event(start: i64, end: i64, text: &str) -> SubtitleEvent {
        SubtitleEvent {
            start_ms: start,
            end_ms: end,
            text: text.into(),
            style: None,
            layer: 0,
        }
    }

    fn srt(events: Vec<SubtitleEvent>) -> Subtitles {
        Subtitles {
            format: SubtitleFormat::Srt,
            encoding: "utf-8",
            had_bom: false,
            events,
            styles: Vec::new(),
            script_info: Vec::new(),
        }
    }

    #[test]
    fn single_clean_event_scores_perfect() {
        let subs = srt(vec![event(0, 2000, "hello")]);
        let issues = check_subtitles(&subs);
        assert!(issues.is_empty());
        assert_eq!(score(&issues), 100);
    }

    #[test]
    fn overlap_severity_depends_on_magnitude() {
        let subs = srt(vec![event(0, 1400, "a"), event(1000, 2000, "b")]);
        let issues = check_subtitles(&subs);
        let overlap = issues.iter().find(|i| i.check == "timing_overlaps").unwrap();
        assert_eq!(overlap.severity, Severity::Warning);

        let subs = srt(vec![event(0, 2000, "a"), event(1000, 3000, "b")]);
        let issues = check_subtitles(&subs);
        let overlap = issues.iter().find(|i| i.check == "timing_overlaps").unwrap();
        assert_eq!(overlap.severity, Severity::Error);
    }

    #[test]
    fn duplicates_and_empties_are_flagged() {
        let subs = srt(vec![
            event(0, 1000, "same"),
            event(0, 1000, "same"),
            event(2000, 3000, "  "),
        ]);
        let issues = check_subtitles(&subs);
        assert!(issues.iter().any(|i| i.check == "duplicate_lines"));
        assert!(issues.iter().any(|i| i.check == "empty_events"));
    }

    #[test]
    fn missing_style_reference_is_an_error() {
        let mut e = event(0, 1000, "line");
        e.style = Some("Ghost".into());
        let subs = Subtitles {
            format: SubtitleFormat::Ass,
            encoding: "utf-8",
            had_bom: false,
            events: vec![e],
            styles: vec![Style {
                name: "Default".into(),
                properties: Default::default(),
            }],
            script_info: Vec::new(),
        };
        let issues = check_subtitles(&subs);
        let missing = issues.iter().find(|i| i.check == "missing_styles").unwrap();
        assert_eq!(missing.severity, Severity::Error);
        assert_eq!(score(&issues), 90);
    }

    #[test]
    fn score_is_clamped_at_zero() {
        let events: Vec<SubtitleEvent> = (0..30).map(|_| event(-5, -1, "bad")).collect();
        let subs = srt(events);
        assert_eq!(score(&check_subtitles(&subs)), 0);
    }

    #[tokio::test]
    async fn backup_copies_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.srt");
        assert!(backup_file(&path).await.unwrap().is_none());
        std::fs::write(&path, "content").unwrap();
        let backup = backup_file(&path).await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "content");
    }
}
