use std::sync::LazyLock;

use regex::Regex;

use crate::app_state::AppError;

use super::{SubtitleEvent, SubtitleFormat, Subtitles};

static TIME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2}):(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(\d{2}):(\d{2}):(\d{2})[,.](\d{3})")
        .unwrap()
});

pub fn detect(content: &str) -> bool {
    TIME_LINE.is_match(content)
}

/// Parse SubRip text. Input must already be LF-normalized. Blocks without a
/// valid timing line are skipped, missing indices are tolerated.
pub fn parse(content: &str) -> Result<Subtitles, AppError> {
    let content = content.trim_start_matches('\u{feff}');
    let mut events = Vec::new();

    for block in content.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        let mut lines = block.lines().peekable();
        // optional numeric index line
        if let Some(first) = lines.peek() {
            if first.trim().parse::<u64>().is_ok() {
                lines.next();
            }
        }
        let Some(time_line) = lines.next() else {
            continue;
        };
        let Some(caps) = TIME_LINE.captures(time_line) else {
            continue;
        };
        let start_ms = capture_ms(&caps, 1);
        let end_ms = capture_ms(&caps, 5);
        let text = lines.collect::<Vec<_>>().join("\n");
        if text.is_empty() && start_ms == 0 && end_ms == 0 {
            continue;
        }
        events.push(SubtitleEvent {
            start_ms,
            end_ms,
            text,
            style: None,
            layer: 0,
        });
    }

    if events.is_empty() {
        return Err(AppError::content_invalid("srt file contains no events"));
    }

    Ok(Subtitles {
        format: SubtitleFormat::Srt,
        encoding: "utf-8",
        had_bom: false,
        events,
        styles: Vec::new(),
        script_info: Vec::new(),
    })
}

fn capture_ms(caps: &regex::Captures, start_group: usize) -> i64 {
    let hours: i64 = caps[start_group].parse().unwrap_or(0);
    let minutes: i64 = caps[start_group + 1].parse().unwrap_or(0);
    let seconds: i64 = caps[start_group + 2].parse().unwrap_or(0);
    let millis: i64 = caps[start_group + 3].parse().unwrap_or(0);
    hours * 3_600_000 + minutes * 60_000 + seconds * 1_000 + millis
}

pub fn serialize(subs: &Subtitles) -> String {
    let mut output = String::new();
    for (i, event) in subs.events.iter().enumerate() {
        output.push_str(&format!("{}\n", i + 1));
        output.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(event.start_ms.max(0)),
            format_timestamp(event.end_ms.max(0))
        ));
        // ASS-origin events carry soft line breaks as \N
        let text = event.text.replace("\\N", "\n").replace("\\n", "\n");
        output.push_str(&text);
        output.push_str("\n\n");
    }
    output
}

fn format_timestamp(ms: i64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SRT: &str = "1\n00:00:01,000 --> 00:00:03,000\nHello, World!\n\n2\n00:00:05,000 --> 00:00:08,000\nThis is a test subtitle.\nSecond line\n\n";

    #[test]
    fn parses_basic_file() {
        let subs = parse(SAMPLE_SRT).unwrap();
        assert_eq!(subs.events.len(), 2);
        assert_eq!(subs.events[0].start_ms, 1000);
        assert_eq!(subs.events[0].end_ms, 3000);
        assert_eq!(subs.events[0].text, "Hello, World!");
        assert_eq!(subs.events[1].text, "This is a test subtitle.\nSecond line");
    }

    #[test]
    fn tolerates_missing_index_and_dot_millis() {
        let content = "00:00:01.500 --> 00:00:02.500\nno index here\n\n";
        let subs = parse(content).unwrap();
        assert_eq!(subs.events[0].start_ms, 1500);
        assert_eq!(subs.events[0].text, "no index here");
    }

    #[test]
    fn serialization_round_trips() {
        let subs = parse(SAMPLE_SRT).unwrap();
        let serialized = serialize(&subs);
        let reparsed = parse(&serialized).unwrap();
        assert_eq!(subs.events.len(), reparsed.events.len());
        for (o, r) in subs.events.iter().zip(reparsed.events.iter()) {
            assert_eq!(o.start_ms, r.start_ms);
            assert_eq!(o.end_ms, r.end_ms);
            assert_eq!(o.text, r.text);
        }
    }

    #[test]
    fn serialized_output_uses_lf_only() {
        let subs = parse(SAMPLE_SRT).unwrap();
        assert!(!serialize(&subs).contains('\r'));
    }

    #[test]
    fn rejects_non_srt_content() {
        assert!(parse("not a subtitle at all").is_err());
        assert!(!detect("WEBVTT garbage"));
    }
}
