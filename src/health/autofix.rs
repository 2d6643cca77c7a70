use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use crate::{
    app_state::AppError,
    events::{Event, EventBus},
    subtitles::{Style, SubtitleFormat, Subtitles},
};

use super::backup_file;

/// Minimum duration given to zero-length events.
const MIN_DURATION_MS: i64 = 500;

/// All fixers are idempotent: applying them to already-fixed subtitles
/// reports no changes.
pub fn apply_fixes(subs: &mut Subtitles) -> Vec<&'static str> {
    let mut applied = Vec::new();
    if remove_duplicates(subs) {
        applied.push("duplicates");
    }
    if fix_overlaps(subs) {
        applied.push("overlaps");
    }
    if fix_missing_styles(subs) {
        applied.push("missing_styles");
    }
    if remove_empty_events(subs) {
        applied.push("empty_events");
    }
    if fix_negative_timing(subs) {
        applied.push("negative_timing");
    }
    if fix_zero_duration(subs) {
        applied.push("zero_duration");
    }
    applied
}

fn remove_duplicates(subs: &mut Subtitles) -> bool {
    let mut seen = HashSet::new();
    let before = subs.events.len();
    subs.events.retain(|event| {
        seen.insert((
            event.start_ms,
            event.end_ms,
            event.style.clone(),
            event.text.clone(),
        ))
    });
    subs.events.len() != before
}

/// Clamp each event's end to the start of the next event in the same
/// style+layer track.
fn fix_overlaps(subs: &mut Subtitles) -> bool {
    let mut order: HashMap<(Option<String>, i32), Vec<usize>> = HashMap::new();
    for (index, event) in subs.events.iter().enumerate() {
        order
            .entry((event.style.clone(), event.layer))
            .or_default()
            .push(index);
    }
    let mut changed = false;
    for indices in order.values_mut() {
        indices.sort_by_key(|&i| subs.events[i].start_ms);
        for pair in indices.windows(2) {
            let next_start = subs.events[pair[1]].start_ms;
            let event = &mut subs.events[pair[0]];
            // only clamp when it leaves a positive duration; events sharing
            // a start cannot be untangled by clamping
            if event.end_ms > next_start && next_start > event.start_ms {
                event.end_ms = next_start;
                changed = true;
            }
        }
    }
    changed
}

/// Point undefined style references at `Default`, defining it if needed.
fn fix_missing_styles(subs: &mut Subtitles) -> bool {
    if subs.format != SubtitleFormat::Ass {
        return false;
    }
    let known: HashSet<String> = subs.styles.iter().map(|s| s.name.clone()).collect();
    let mut changed = false;
    for event in &mut subs.events {
        if let Some(style) = &event.style {
            if !known.contains(style) {
                event.style = Some("Default".to_string());
                changed = true;
            }
        }
    }
    if changed && !known.contains("Default") {
        subs.styles.push(Style {
            name: "Default".to_string(),
            properties: HashMap::new(),
        });
    }
    changed
}

fn remove_empty_events(subs: &mut Subtitles) -> bool {
    let before = subs.events.len();
    subs.events.retain(|event| !event.text.trim().is_empty());
    subs.events.len() != before
}

fn fix_negative_timing(subs: &mut Subtitles) -> bool {
    let mut changed = false;
    for event in &mut subs.events {
        if event.start_ms < 0 {
            event.start_ms = 0;
            changed = true;
        }
        if event.end_ms < event.start_ms {
            event.end_ms = event.start_ms;
            changed = true;
        }
    }
    changed
}

fn fix_zero_duration(subs: &mut Subtitles) -> bool {
    let mut changed = false;
    for event in &mut subs.events {
        if event.duration_ms() == 0 && !event.text.trim().is_empty() {
            event.end_ms = event.start_ms + MIN_DURATION_MS;
            changed = true;
        }
    }
    changed
}

/// Fix a file in place: parse, fix on the model, re-serialize. A `.bak` is
/// written before the mutation; a failed write restores from it.
pub async fn fix_file(path: &Path, events: &EventBus) -> Result<Vec<&'static str>, AppError> {
    let mut subs = Subtitles::parse_file(path)?;
    let applied = apply_fixes(&mut subs);
    if applied.is_empty() {
        return Ok(applied);
    }
    let backup = backup_file(path).await?;
    let serialized = subs.serialize(subs.format);
    if let Err(write_error) = tokio::fs::write(path, &serialized).await {
        if let Some(backup) = &backup {
            if let Err(restore_error) = tokio::fs::copy(backup, path).await {
                tracing::error!(
                    path = %path.display(),
                    "Restore from backup failed after write error: {restore_error}"
                );
            }
        }
        return Err(write_error.into());
    }
    events.publish(Event::AutofixApplied {
        file_path: path.to_string_lossy().to_string(),
        fixes: applied.iter().map(|f| f.to_string()).collect(),
    });
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitles::SubtitleEvent;

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
    fn fixers_are_idempotent() {
        let mut subs = srt(vec![
            event(-100, 1000, "negative start"),
            event(500, 500, "zero"),
            event(1500, 1600, "  "),
            event(2000, 4000, "overlap a"),
            event(3000, 5000, "overlap b"),
            event(6000, 7000, "dup"),
            event(6000, 7000, "dup"),
        ]);
        let applied = apply_fixes(&mut subs);
        assert!(applied.contains(&"duplicates"));
        assert!(applied.contains(&"negative_timing"));
        assert!(applied.contains(&"zero_duration"));
        assert!(applied.contains(&"empty_events"));
        assert!(applied.contains(&"overlaps"));

        // second pass finds nothing left to fix
        let applied = apply_fixes(&mut subs);
        assert!(applied.is_empty(), "second pass applied {applied:?}");
        assert!(super::super::check_subtitles(&subs).is_empty());
    }

    #[test]
    fn missing_style_reassigned_to_default() {
        let mut e = event(0, 1000, "line");
        e.style = Some("Ghost".into());
        let mut subs = Subtitles {
            format: SubtitleFormat::Ass,
            encoding: "utf-8",
            had_bom: false,
            events: vec![e],
            styles: Vec::new(),
            script_info: Vec::new(),
        };
        assert!(fix_missing_styles(&mut subs));
        assert_eq!(subs.events[0].style.as_deref(), Some("Default"));
        assert!(subs.styles.iter().any(|s| s.name == "Default"));
        assert!(!fix_missing_styles(&mut subs));
    }

    #[tokio::test]
    async fn fix_file_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.srt");
        std::fs::write(
            &path,
            "1\n00:00:01,000 --> 00:00:01,000\nzero duration\n\n2\n00:00:02,000 --> 00:00:03,000\nok\n\n",
        )
        .unwrap();
        let events = EventBus::sink();
        let applied = fix_file(&path, &events).await.unwrap();
        assert_eq!(applied, vec!["zero_duration"]);
        assert!(dir.path().join("broken.srt.bak").exists());
        let fixed = Subtitles::parse_file(&path).unwrap();
        assert_eq!(fixed.events[0].end_ms, 1500);
    }
}
