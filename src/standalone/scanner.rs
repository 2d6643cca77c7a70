use std::sync::LazyLock;

use regex::Regex;

/// Fansub groups that identify a release as anime even without other
/// indicators. Lower-cased.
const KNOWN_ANIME_GROUPS: &[&str] = &[
    "horriblesubs",
    "subsplease",
    "erai-raws",
    "yameii",
    "judas",
    "ember",
    "asw",
    "commie",
    "underwater",
    "vcb-studio",
    "yuisubs",
];

const NAME_NOISE: &[&str] = &[
    "2160p", "1080p", "720p", "480p", "4k", "uhd", "hdr", "bluray", "blu-ray", "bdrip", "brrip",
    "webrip", "web-dl", "webdl", "web", "hdtv", "dvdrip", "x264", "x265", "h264", "h265", "hevc",
    "avc", "aac", "ac3", "eac3", "dts", "flac", "opus", "dual", "multi", "dubbed", "subbed",
    "proper", "repack", "remux", "complete", "internal", "amzn", "nf", "dsnp", "atvp", "ddp5",
    "dd5",
];

static SEASON_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bs(\d{1,4})[ ._-]?e(\d{1,4})\b").unwrap());
static CROSS_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,4})x(\d{2,3})\b").unwrap());
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());
static RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(480p|576p|720p|1080p|2160p|4k)\b").unwrap());
static CRC32: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([0-9A-Fa-f]{8})\]").unwrap());
static BRACKET_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]").unwrap());
static SCENE_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-([A-Za-z0-9]+)$").unwrap());
static ABSOLUTE_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ _.](\d{1,4})(?:[ _.(\[]|$)").unwrap());

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFilename {
    pub title: String,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub year: Option<i64>,
    pub release_group: Option<String>,
    pub resolution: Option<String>,
    pub crc32: Option<String>,
    pub is_anime: bool,
}

impl ParsedFilename {
    pub fn is_episode(&self) -> bool {
        self.episode.is_some()
    }
}

/// Anime indicators: a leading square-bracket fansub group, a known group
/// name, a CRC32 infix, or absolute-episode numbering without any SxxExx
/// marker.
pub fn detect_anime(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    if let Some(caps) = BRACKET_GROUP.captures(file_name) {
        let group = caps[1].to_lowercase();
        if KNOWN_ANIME_GROUPS.contains(&group.as_str()) {
            return true;
        }
        // an unknown leading bracket group plus a CRC32 tag is still a
        // strong fansub signature
        if CRC32.is_match(file_name) {
            return true;
        }
    }
    if KNOWN_ANIME_GROUPS
        .iter()
        .any(|g| lower.contains(&format!("[{g}]")))
    {
        return true;
    }
    if CRC32.is_match(file_name) && !SEASON_EPISODE.is_match(file_name) {
        return true;
    }
    false
}

/// Parse a media file name into its identifying parts. With
/// `prefer_absolute`, a bare ` - NNN` number is read as an absolute episode
/// before the standard SxxExx patterns are tried.
pub fn parse_media_filename(file_name: &str, prefer_absolute: bool) -> ParsedFilename {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, ext)| if ext.len() <= 4 { stem } else { file_name })
        .unwrap_or(file_name);

    let mut parsed = ParsedFilename {
        is_anime: detect_anime(file_name),
        ..Default::default()
    };
    parsed.crc32 = CRC32.captures(stem).map(|c| c[1].to_uppercase());
    parsed.resolution = RESOLUTION
        .captures(stem)
        .map(|c| c[1].to_lowercase());

    // strip bracket chunks; they hold group tags and checksums, never titles
    let without_brackets = strip_brackets(stem);

    // release years are often parenthesized; the last match wins so a year
    // that is part of the title ("Blade Runner 2049 (2017)") survives
    let year_text = YEAR
        .captures_iter(stem)
        .last()
        .map(|caps| caps[1].to_string());
    parsed.year = year_text.as_deref().and_then(|y| y.parse().ok());

    let mut episode_span: Option<(usize, usize)> = None;
    if prefer_absolute || parsed.is_anime {
        if let Some(caps) = absolute_episode(&without_brackets) {
            parsed.season = Some(1);
            parsed.episode = Some(caps.0);
            episode_span = Some(caps.1);
        }
    }
    if parsed.episode.is_none() {
        if let Some(caps) = SEASON_EPISODE.captures(&without_brackets) {
            parsed.season = caps[1].parse().ok();
            parsed.episode = caps[2].parse().ok();
            let m = caps.get(0).unwrap();
            episode_span = Some((m.start(), m.end()));
        } else if let Some(caps) = CROSS_EPISODE.captures(&without_brackets) {
            parsed.season = caps[1].parse().ok();
            parsed.episode = caps[2].parse().ok();
            let m = caps.get(0).unwrap();
            episode_span = Some((m.start(), m.end()));
        } else if !prefer_absolute && !parsed.is_anime {
            // last resort for shows dropped without a season marker
            if let Some(caps) = absolute_episode(&without_brackets) {
                parsed.season = Some(1);
                parsed.episode = Some(caps.0);
                episode_span = Some(caps.1);
            }
        }
    }

    if !parsed.is_anime {
        parsed.release_group = SCENE_GROUP
            .captures(stem)
            .map(|c| c[1].to_string())
            .filter(|g| !NAME_NOISE.contains(&g.to_lowercase().as_str()));
    } else if let Some(caps) = BRACKET_GROUP.captures(file_name) {
        parsed.release_group = Some(caps[1].to_string());
    }

    // title = everything before the episode marker / year / first noise token
    let mut title_end = without_brackets.len();
    if let Some((start, _)) = episode_span {
        title_end = title_end.min(start);
    }
    if let Some(year_text) = &year_text {
        for m in YEAR.find_iter(&without_brackets) {
            if m.as_str() == year_text {
                title_end = title_end.min(m.start());
                break;
            }
        }
    }
    let head = &without_brackets[..title_end];
    for token in head.split(['.', '_', ' ', '-']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if NAME_NOISE.contains(&token.to_lowercase().as_str()) {
            if let Some(pos) = without_brackets.find(token) {
                if pos < title_end {
                    title_end = pos;
                }
            }
            break;
        }
    }
    parsed.title = clean_title(&without_brackets[..title_end]);
    parsed
}

fn absolute_episode(name: &str) -> Option<(i64, (usize, usize))> {
    // `Title - 12` style first
    if let Some(pos) = name.rfind(" - ") {
        let tail = &name[pos + 3..];
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 1 && digits.len() <= 4 {
            if let Ok(number) = digits.parse::<i64>() {
                if !(1900..=2099).contains(&number) {
                    return Some((number, (pos, pos + 3 + digits.len())));
                }
            }
        }
    }
    if let Some(caps) = ABSOLUTE_EPISODE.captures(name) {
        let m = caps.get(1).unwrap();
        if let Ok(number) = m.as_str().parse::<i64>() {
            if !(1900..=2099).contains(&number) {
                return Some((number, (m.start(), m.end())));
            }
        }
    }
    None
}

fn strip_brackets(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for ch in name.chars() {
        match ch {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn clean_title(raw: &str) -> String {
    let spaced = raw.replace(['.', '_'], " ");
    spaced
        .split_whitespace()
        .filter(|t| *t != "-")
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(['-', ' '])
        .to_string()
}

/// Grouping key for standalone series: lower-cased alphanumeric words.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_episode_names() {
        let parsed = parse_media_filename(
            "Cyberpunk.Edgerunners.S01E02.DUBBED.1080p.WEBRip.x265-RARBG.mkv",
            false,
        );
        assert_eq!(parsed.title, "Cyberpunk Edgerunners");
        assert_eq!(parsed.season, Some(1));
        assert_eq!(parsed.episode, Some(2));
        assert_eq!(parsed.resolution.as_deref(), Some("1080p"));
        assert!(!parsed.is_anime);

        let parsed = parse_media_filename("shogun.2024.s01e05.2160p.web.h265-successfulcrab.mkv", false);
        assert_eq!(parsed.title, "shogun");
        assert_eq!(parsed.year, Some(2024));
        assert_eq!(parsed.season, Some(1));
        assert_eq!(parsed.episode, Some(5));
        assert_eq!(parsed.release_group.as_deref(), Some("successfulcrab"));
    }

    #[test]
    fn cross_notation() {
        let parsed = parse_media_filename("The Walking Dead 4x01.mp4", false);
        assert_eq!(parsed.title, "The Walking Dead");
        assert_eq!(parsed.season, Some(4));
        assert_eq!(parsed.episode, Some(1));
    }

    #[test]
    fn movie_fallback_has_no_episode() {
        let parsed = parse_media_filename("Aladdin.1992.1080p.BluRay.x264-SOFCJ.mkv", false);
        assert_eq!(parsed.title, "Aladdin");
        assert_eq!(parsed.year, Some(1992));
        assert!(!parsed.is_episode());
        assert_eq!(parsed.release_group.as_deref(), Some("SOFCJ"));
    }

    #[test]
    fn anime_release_with_group_and_crc() {
        let name = "[SubsPlease] Sousou no Frieren - 28 (1080p) [A41B325E].mkv";
        assert!(detect_anime(name));
        let parsed = parse_media_filename(name, false);
        assert!(parsed.is_anime);
        assert_eq!(parsed.title, "Sousou no Frieren");
        assert_eq!(parsed.season, Some(1));
        assert_eq!(parsed.episode, Some(28));
        assert_eq!(parsed.crc32.as_deref(), Some("A41B325E"));
        assert_eq!(parsed.release_group.as_deref(), Some("SubsPlease"));
    }

    #[test]
    fn absolute_numbering_beyond_cross_pattern() {
        let parsed = parse_media_filename("[Judas] One Piece - 1001.mkv", false);
        assert_eq!(parsed.episode, Some(1001));
        assert_eq!(parsed.title, "One Piece");
    }

    #[test]
    fn year_is_not_an_episode() {
        let parsed = parse_media_filename("Blade Runner 2049 (2017).mkv", false);
        assert!(!parsed.is_episode());
        assert_eq!(parsed.year, Some(2017));
        assert_eq!(parsed.title, "Blade Runner 2049");
    }

    #[test]
    fn title_normalization_groups_variants() {
        assert_eq!(
            normalize_title("Sousou no Frieren"),
            normalize_title("sousou_no_frieren")
        );
        assert_eq!(normalize_title("The Show! (2020)"), "the show 2020");
    }
}
