use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::app_state::AppError;

pub mod ass;
pub mod encoding;
pub mod srt;

pub const SUBTITLE_EXTENSIONS: [&str; 3] = ["srt", "ass", "ssa"];
pub const VIDEO_EXTENSIONS: [&str; 5] = ["mkv", "mp4", "webm", "avi", "m2ts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    Srt,
    Ass,
}

impl Display for SubtitleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtitleFormat::Srt => write!(f, "srt"),
            SubtitleFormat::Ass => write!(f, "ass"),
        }
    }
}

impl FromStr for SubtitleFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "srt" => Ok(Self::Srt),
            "ass" | "ssa" => Ok(Self::Ass),
            rest => Err(AppError::bad_request(format!(
                "unknown subtitle format: {rest}"
            ))),
        }
    }
}

/// Subtitle track kind. `Full` covers all dialog, `Forced` only
/// foreign-language portions, `Signs` non-dialog on-screen text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleKind {
    Full,
    Forced,
    Signs,
}

impl Display for SubtitleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtitleKind::Full => write!(f, "full"),
            SubtitleKind::Forced => write!(f, "forced"),
            SubtitleKind::Signs => write!(f, "signs"),
        }
    }
}

impl FromStr for SubtitleKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "forced" => Ok(Self::Forced),
            "signs" => Ok(Self::Signs),
            rest => Err(AppError::bad_request(format!(
                "unknown subtitle kind: {rest}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleEvent {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub style: Option<String>,
    pub layer: i32,
}

impl SubtitleEvent {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    pub name: String,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Subtitles {
    pub format: SubtitleFormat,
    pub encoding: &'static str,
    pub had_bom: bool,
    pub events: Vec<SubtitleEvent>,
    pub styles: Vec<Style>,
    pub script_info: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleClass {
    Dialog,
    Signs,
    Songs,
}

impl Subtitles {
    /// Decode bytes, sniff the format and parse.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        let decoded = encoding::decode(bytes);
        let text = decoded.text.replace("\r\n", "\n").replace('\r', "\n");
        let mut subs = if ass::detect(&text) {
            ass::parse(&text)?
        } else if srt::detect(&text) {
            srt::parse(&text)?
        } else {
            return Err(AppError::content_invalid("unrecognized subtitle format"));
        };
        subs.encoding = decoded.encoding;
        subs.had_bom = decoded.had_bom;
        Ok(subs)
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::parse_bytes(&bytes)
    }

    /// Serialize into `format`. Output always uses LF line endings and UTF-8.
    pub fn serialize(&self, format: SubtitleFormat) -> Vec<u8> {
        match format {
            SubtitleFormat::Srt => srt::serialize(self).into_bytes(),
            SubtitleFormat::Ass => ass::serialize(self).into_bytes(),
        }
    }

    pub fn shift(&mut self, delta_ms: i64) {
        for event in &mut self.events {
            event.start_ms = (event.start_ms + delta_ms).max(0);
            event.end_ms = (event.end_ms + delta_ms).max(0);
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for event in &mut self.events {
            event.start_ms = ((event.start_ms as f64) * factor).round().max(0.0) as i64;
            event.end_ms = ((event.end_ms as f64) * factor).round().max(0.0) as i64;
        }
    }

    /// Retime events authored for `in_fps` so they play correctly at `out_fps`.
    pub fn transform_framerate(&mut self, in_fps: f64, out_fps: f64) {
        if in_fps <= 0.0 || out_fps <= 0.0 {
            return;
        }
        self.scale(in_fps / out_fps);
    }

    /// Heuristic classification of ASS styles into dialog, signs and songs.
    ///
    /// Signals, in decreasing weight: style name markers, positioning override
    /// tags, karaoke tags, and the uppercase/symbol density of the style's
    /// event text.
    pub fn classify_styles(&self) -> HashMap<String, StyleClass> {
        let mut per_style: HashMap<&str, Vec<&SubtitleEvent>> = HashMap::new();
        for event in &self.events {
            let name = event.style.as_deref().unwrap_or("Default");
            per_style.entry(name).or_default().push(event);
        }

        let mut out = HashMap::new();
        for style in &self.styles {
            let events = per_style.remove(style.name.as_str()).unwrap_or_default();
            out.insert(style.name.clone(), classify_style(&style.name, &events));
        }
        // Styles referenced by events but missing from the style table still
        // get classified so callers see every used name.
        for (name, events) in per_style {
            out.insert(name.to_string(), classify_style(name, &events));
        }
        out
    }
}

fn classify_style(name: &str, events: &[&SubtitleEvent]) -> StyleClass {
    let lower = name.to_lowercase();
    if ["song", "kara", "op", "ed", "insert"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return StyleClass::Songs;
    }
    if ["sign", "caption", "title", "credit"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return StyleClass::Signs;
    }
    if events.is_empty() {
        return StyleClass::Dialog;
    }

    let mut karaoke = 0usize;
    let mut positioned = 0usize;
    let mut shouty = 0usize;
    for event in events {
        let text = event.text.as_str();
        if text.contains("\\k") || text.contains("\\K") {
            karaoke += 1;
        }
        if text.contains("\\pos(") || text.contains("\\move(") {
            positioned += 1;
        }
        let letters = text.chars().filter(|c| c.is_alphabetic()).count();
        let upper = text.chars().filter(|c| c.is_uppercase()).count();
        if letters > 0 && upper * 2 > letters {
            shouty += 1;
        }
    }
    let total = events.len();
    if karaoke * 2 > total {
        StyleClass::Songs
    } else if positioned * 2 > total || shouty * 2 > total {
        StyleClass::Signs
    } else {
        StyleClass::Dialog
    }
}

pub fn format_of_path(path: &Path) -> Option<SubtitleFormat> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    SubtitleFormat::from_str(&ext).ok()
}

pub fn is_subtitle_file(path: &PathBuf) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUBTITLE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_video_file(path: &PathBuf) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// A subtitle file name decomposed according to the sidecar conventions:
/// `<basename>.<lang>.<ext>`, `<basename>.<lang>.forced.<ext>` and
/// `<basename>.<lang>.sdh.<ext>`, optionally under a `Subs`/`Subtitles`
/// subdirectory.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitlePath {
    pub video_basename: String,
    pub language: String,
    pub kind: SubtitleKind,
    pub sdh: bool,
    pub format: SubtitleFormat,
}

impl SubtitlePath {
    pub fn parse(path: &Path) -> Option<Self> {
        let format = format_of_path(path)?;
        let stem = path.file_stem()?.to_str()?;
        let mut parts: Vec<&str> = stem.rsplitn(3, '.').collect();
        parts.reverse();

        let (basename, language, kind, sdh) = match parts.as_slice() {
            [base, lang, "forced"] => (base.to_string(), lang.to_string(), SubtitleKind::Forced, false),
            [base, lang, "sdh"] => (base.to_string(), lang.to_string(), SubtitleKind::Full, true),
            [base_a, base_b, lang] => (
                format!("{base_a}.{base_b}"),
                lang.to_string(),
                SubtitleKind::Full,
                false,
            ),
            [base, lang] => (base.to_string(), lang.to_string(), SubtitleKind::Full, false),
            _ => return None,
        };
        if !is_language_code(&language) {
            return None;
        }
        Some(Self {
            video_basename: basename,
            language: language.to_lowercase(),
            kind,
            sdh,
            format,
        })
    }

    /// Canonical sidecar path next to `video_path`.
    pub fn render(
        video_path: &Path,
        language: &str,
        kind: SubtitleKind,
        format: SubtitleFormat,
    ) -> PathBuf {
        let stem = video_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let infix = match kind {
            SubtitleKind::Full => String::new(),
            // Signs tracks share the forced infix so media servers pick them up.
            SubtitleKind::Forced | SubtitleKind::Signs => ".forced".to_string(),
        };
        let file_name = format!("{stem}.{}{infix}.{format}", language.to_lowercase());
        video_path.with_file_name(file_name)
    }

    /// Does this sidecar belong to the video at `video_path`? Matches same
    /// directory plus the `Subs`/`Subtitles` subdirectory convention.
    pub fn belongs_to(sub_path: &Path, video_path: &Path) -> bool {
        let Some(parsed) = Self::parse(sub_path) else {
            return false;
        };
        let Some(video_stem) = video_path.file_stem().and_then(|s| s.to_str()) else {
            return false;
        };
        if parsed.video_basename != video_stem {
            return false;
        }
        let video_dir = video_path.parent();
        let sub_dir = sub_path.parent();
        match (video_dir, sub_dir) {
            (Some(vd), Some(sd)) => {
                sd == vd
                    || (sd.parent() == Some(vd)
                        && sd
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.eq_ignore_ascii_case("subs") || n.eq_ignore_ascii_case("subtitles"))
                            .unwrap_or(false))
            }
            _ => false,
        }
    }
}

fn is_language_code(code: &str) -> bool {
    (code.len() == 2 || code.len() == 3) && code.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn event(start: i64, end: i64, text: &str) -> SubtitleEvent {
        SubtitleEvent {
            start_ms: start,
            end_ms: end,
            text: text.to_string(),
            style: None,
            layer: 0,
        }
    }

    fn subs(events: Vec<SubtitleEvent>) -> Subtitles {
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
    fn shift_clamps_to_zero() {
        let mut s = subs(vec![event(500, 1500, "a")]);
        s.shift(-1000);
        assert_eq!(s.events[0].start_ms, 0);
        assert_eq!(s.events[0].end_ms, 500);
    }

    #[test]
    fn scale_rounds_to_nearest() {
        let mut s = subs(vec![event(1001, 2001, "a")]);
        s.scale(1.0005);
        assert_eq!(s.events[0].start_ms, 1002);
    }

    #[test]
    fn framerate_transform_round_trips_within_a_millisecond() {
        let original = vec![event(123_456, 130_000, "a"), event(3_600_000, 3_605_000, "b")];
        let mut s = subs(original.clone());
        s.transform_framerate(23.976, 25.0);
        s.transform_framerate(25.0, 23.976);
        for (before, after) in original.iter().zip(s.events.iter()) {
            assert!((before.start_ms - after.start_ms).abs() <= 1);
            assert!((before.end_ms - after.end_ms).abs() <= 1);
        }
    }

    #[test]
    fn sidecar_path_round_trip() {
        let video = Path::new("/m/Show/S01/Show.S01E02.mkv");
        let full = SubtitlePath::render(video, "en", SubtitleKind::Full, SubtitleFormat::Srt);
        assert_eq!(full, Path::new("/m/Show/S01/Show.S01E02.en.srt"));
        let forced = SubtitlePath::render(video, "EN", SubtitleKind::Forced, SubtitleFormat::Srt);
        assert_eq!(forced, Path::new("/m/Show/S01/Show.S01E02.en.forced.srt"));

        let parsed = SubtitlePath::parse(&forced).unwrap();
        assert_eq!(parsed.kind, SubtitleKind::Forced);
        assert_eq!(parsed.language, "en");
        assert_eq!(parsed.video_basename, "Show.S01E02");

        let parsed = SubtitlePath::parse(&full).unwrap();
        assert_eq!(parsed.kind, SubtitleKind::Full);
    }

    #[test]
    fn sdh_infix_is_full_kind() {
        let parsed = SubtitlePath::parse(Path::new("/m/Movie.2020.en.sdh.srt")).unwrap();
        assert!(parsed.sdh);
        assert_eq!(parsed.kind, SubtitleKind::Full);
    }

    #[test]
    fn subs_subdirectory_belongs_to_video() {
        let video = Path::new("/m/Show/S01/Show.S01E02.mkv");
        assert!(SubtitlePath::belongs_to(
            Path::new("/m/Show/S01/Subs/Show.S01E02.en.srt"),
            video
        ));
        assert!(SubtitlePath::belongs_to(
            Path::new("/m/Show/S01/Show.S01E02.en.forced.srt"),
            video
        ));
        assert!(!SubtitlePath::belongs_to(
            Path::new("/m/Show/S01/Show.S01E03.en.srt"),
            video
        ));
    }

    #[test]
    fn style_classification_finds_songs_and_signs() {
        let styles = vec![
            Style {
                name: "Default".into(),
                properties: HashMap::new(),
            },
            Style {
                name: "OP-kara".into(),
                properties: HashMap::new(),
            },
            Style {
                name: "Overlay".into(),
                properties: HashMap::new(),
            },
        ];
        let mut events = vec![
            SubtitleEvent {
                start_ms: 0,
                end_ms: 2000,
                text: "Regular dialog line".into(),
                style: Some("Default".into()),
                layer: 0,
            },
            SubtitleEvent {
                start_ms: 0,
                end_ms: 2000,
                text: "{\\pos(640,120)}TRAIN STATION".into(),
                style: Some("Overlay".into()),
                layer: 1,
            },
        ];
        events.push(events[1].clone());
        let s = Subtitles {
            format: SubtitleFormat::Ass,
            encoding: "utf-8",
            had_bom: false,
            events,
            styles,
            script_info: Vec::new(),
        };
        let classes = s.classify_styles();
        assert_eq!(classes["Default"], StyleClass::Dialog);
        assert_eq!(classes["OP-kara"], StyleClass::Songs);
        assert_eq!(classes["Overlay"], StyleClass::Signs);
    }
}
