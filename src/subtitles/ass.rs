use std::collections::HashMap;

use crate::app_state::AppError;

use super::{Style, SubtitleEvent, SubtitleFormat, Subtitles};

pub fn detect(content: &str) -> bool {
    let head: String = content.chars().take(512).collect::<String>().to_lowercase();
    head.contains("[script info]") || head.contains("[v4+ styles]") || head.contains("[events]")
}

#[derive(Debug, PartialEq)]
enum Section {
    ScriptInfo,
    Styles,
    Events,
    Other,
}

/// Parse Advanced SubStation Alpha. Input must already be LF-normalized.
/// `Format:` lines drive the field mapping in both the styles and events
/// sections, so column reordering is handled.
pub fn parse(content: &str) -> Result<Subtitles, AppError> {
    let content = content.trim_start_matches('\u{feff}');
    let mut section = Section::Other;
    let mut style_format: Vec<String> = Vec::new();
    let mut event_format: Vec<String> = Vec::new();
    let mut styles = Vec::new();
    let mut events = Vec::new();
    let mut script_info = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        if trimmed.starts_with('[') {
            section = match trimmed.to_lowercase().as_str() {
                "[script info]" => Section::ScriptInfo,
                "[v4+ styles]" | "[v4 styles]" => Section::Styles,
                "[events]" => Section::Events,
                _ => Section::Other,
            };
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim_start();
        match section {
            Section::ScriptInfo => {
                script_info.push((key.to_string(), value.to_string()));
            }
            Section::Styles => match key {
                "Format" => {
                    style_format = value.split(',').map(|f| f.trim().to_string()).collect();
                }
                "Style" => {
                    let fields: Vec<&str> = value.splitn(style_format.len(), ',').collect();
                    let mut properties = HashMap::new();
                    for (name, field) in style_format.iter().zip(fields.iter()) {
                        properties.insert(name.clone(), field.trim().to_string());
                    }
                    let name = properties.remove("Name").unwrap_or_default();
                    styles.push(Style { name, properties });
                }
                _ => {}
            },
            Section::Events => match key {
                "Format" => {
                    event_format = value.split(',').map(|f| f.trim().to_string()).collect();
                }
                "Dialogue" => {
                    let format = if event_format.is_empty() {
                        default_event_format()
                    } else {
                        event_format.clone()
                    };
                    let fields: Vec<&str> = value.splitn(format.len(), ',').collect();
                    let mut row: HashMap<&str, &str> = HashMap::new();
                    for (name, field) in format.iter().zip(fields.iter()) {
                        row.insert(name.as_str(), field);
                    }
                    let start_ms = row.get("Start").and_then(|v| parse_timestamp(v));
                    let end_ms = row.get("End").and_then(|v| parse_timestamp(v));
                    let (Some(start_ms), Some(end_ms)) = (start_ms, end_ms) else {
                        continue;
                    };
                    events.push(SubtitleEvent {
                        start_ms,
                        end_ms,
                        text: row.get("Text").unwrap_or(&"").to_string(),
                        style: row.get("Style").map(|s| s.trim().to_string()),
                        layer: row
                            .get("Layer")
                            .and_then(|l| l.trim().parse().ok())
                            .unwrap_or(0),
                    });
                }
                _ => {}
            },
            Section::Other => {}
        }
    }

    if events.is_empty() && styles.is_empty() {
        return Err(AppError::content_invalid("ass file contains no events"));
    }

    Ok(Subtitles {
        format: SubtitleFormat::Ass,
        encoding: "utf-8",
        had_bom: false,
        events,
        styles,
        script_info,
    })
}

fn default_event_format() -> Vec<String> {
    [
        "Layer", "Start", "End", "Style", "Name", "MarginL", "MarginR", "MarginV", "Effect",
        "Text",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

const STYLE_FORMAT: &str =
    "Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding";

pub fn serialize(subs: &Subtitles) -> String {
    let mut out = String::new();
    out.push_str("[Script Info]\n");
    if subs.script_info.is_empty() {
        out.push_str("ScriptType: v4.00+\n");
    } else {
        for (key, value) in &subs.script_info {
            out.push_str(&format!("{key}: {value}\n"));
        }
    }
    out.push('\n');

    out.push_str("[V4+ Styles]\n");
    out.push_str(&format!("Format: {STYLE_FORMAT}\n"));
    let style_fields: Vec<&str> = STYLE_FORMAT.split(", ").collect();
    for style in &subs.styles {
        let mut fields = Vec::with_capacity(style_fields.len());
        for name in &style_fields {
            if *name == "Name" {
                fields.push(style.name.clone());
            } else {
                fields.push(
                    style
                        .properties
                        .get(*name)
                        .cloned()
                        .unwrap_or_else(|| default_style_field(name)),
                );
            }
        }
        out.push_str(&format!("Style: {}\n", fields.join(",")));
    }
    out.push('\n');

    out.push_str("[Events]\n");
    out.push_str("Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n");
    for event in &subs.events {
        out.push_str(&format!(
            "Dialogue: {},{},{},{},,0,0,0,,{}\n",
            event.layer,
            format_timestamp(event.start_ms.max(0)),
            format_timestamp(event.end_ms.max(0)),
            event.style.as_deref().unwrap_or("Default"),
            event.text
        ));
    }
    out
}

fn default_style_field(name: &str) -> String {
    match name {
        "Fontname" => "Arial".to_string(),
        "Fontsize" => "48".to_string(),
        "PrimaryColour" => "&H00FFFFFF".to_string(),
        "SecondaryColour" => "&H000000FF".to_string(),
        "OutlineColour" | "BackColour" => "&H00000000".to_string(),
        "ScaleX" | "ScaleY" => "100".to_string(),
        "BorderStyle" | "Outline" => "1".to_string(),
        "Alignment" => "2".to_string(),
        "MarginL" | "MarginR" => "10".to_string(),
        "MarginV" => "20".to_string(),
        "Encoding" => "1".to_string(),
        _ => "0".to_string(),
    }
}

/// `H:MM:SS.cc` centisecond timestamps.
fn parse_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    let mut parts = value.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds_part = parts.next()?;
    let (seconds, centis) = seconds_part.split_once('.')?;
    let seconds: i64 = seconds.parse().ok()?;
    let centis: i64 = centis.parse().ok()?;
    Some(hours * 3_600_000 + minutes * 60_000 + seconds * 1_000 + centis * 10)
}

fn format_timestamp(ms: i64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let centis = (ms % 1_000) / 10;
    format!("{}:{:02}:{:02}.{:02}", hours, minutes, seconds, centis)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ASS: &str = "[Script Info]\nTitle: Sample\nScriptType: v4.00+\n\n[V4+ Styles]\nFormat: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\nStyle: Default,Arial,48,&H00FFFFFF,&H000000FF,&H00000000,&H00000000,0,0,0,0,100,100,0,0,1,2,0,2,10,10,20,1\nStyle: Signs,Arial,36,&H00FFFFFF,&H000000FF,&H00000000,&H00000000,0,0,0,0,100,100,0,0,1,2,0,8,10,10,20,1\n\n[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\nDialogue: 0,0:00:01.00,0:00:03.50,Default,,0,0,0,,Hello there\nDialogue: 1,0:00:02.00,0:00:04.00,Signs,,0,0,0,,{\\pos(640,120)}STATION\n";

    #[test]
    fn parses_styles_and_events() {
        let subs = parse(SAMPLE_ASS).unwrap();
        assert_eq!(subs.styles.len(), 2);
        assert_eq!(subs.styles[0].name, "Default");
        assert_eq!(subs.events.len(), 2);
        assert_eq!(subs.events[0].start_ms, 1000);
        assert_eq!(subs.events[0].end_ms, 3500);
        assert_eq!(subs.events[1].layer, 1);
        assert_eq!(subs.events[1].style.as_deref(), Some("Signs"));
        assert!(subs.events[1].text.contains("\\pos"));
    }

    #[test]
    fn commas_inside_text_survive() {
        let content = "[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\nDialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,One, two, three\n";
        let subs = parse(content).unwrap();
        assert_eq!(subs.events[0].text, "One, two, three");
    }

    #[test]
    fn serialization_round_trips() {
        let subs = parse(SAMPLE_ASS).unwrap();
        let serialized = serialize(&subs);
        let reparsed = parse(&serialized).unwrap();
        assert_eq!(subs.events.len(), reparsed.events.len());
        for (o, r) in subs.events.iter().zip(reparsed.events.iter()) {
            assert_eq!(o.start_ms, r.start_ms);
            assert_eq!(o.end_ms, r.end_ms);
            assert_eq!(o.text, r.text);
            assert_eq!(o.style, r.style);
        }
        assert_eq!(reparsed.styles.len(), 2);
    }

    #[test]
    fn detects_ass_content() {
        assert!(detect(SAMPLE_ASS));
        assert!(!detect("1\n00:00:01,000 --> 00:00:02,000\nplain srt\n"));
    }
}
