use std::path::{Path, PathBuf};

use crate::{
    db::ItemKind,
    profiles::EmbeddedStream,
    subtitles::{SubtitleKind, SubtitlePath},
};

pub mod scanner;
pub mod searcher;

/// A media file as seen by the scanner, regardless of whether it came from
/// a library manager or the standalone subsystem.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub item_kind: ItemKind,
    pub source_ref: String,
    pub instance_name: String,
    pub title: String,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub year: Option<i64>,
    pub path: PathBuf,
    /// Sidecar paths the source already knows about. When empty the scanner
    /// inspects the directory itself.
    pub existing_subs: Vec<PathBuf>,
    pub embedded_streams: Vec<EmbeddedStream>,
}

#[derive(Debug, Clone)]
pub struct ObservedSubtitle {
    pub language: String,
    pub kind: SubtitleKind,
    pub path: PathBuf,
}

/// Sidecar subtitles present for a video. Detection is per track kind: a
/// `.forced.` file never satisfies a full requirement and vice versa.
pub fn observed_subtitles(video_path: &Path, declared: &[PathBuf]) -> Vec<ObservedSubtitle> {
    let mut found = Vec::new();
    let mut push = |path: &Path| {
        if let Some(parsed) = SubtitlePath::parse(path) {
            if SubtitlePath::belongs_to(path, video_path) {
                found.push(ObservedSubtitle {
                    language: parsed.language,
                    kind: parsed.kind,
                    path: path.to_path_buf(),
                });
            }
        }
    };

    for path in declared {
        push(path);
    }
    if !declared.is_empty() {
        return found;
    }

    let Some(dir) = video_path.parent() else {
        return found;
    };
    let mut dirs = vec![dir.to_path_buf()];
    for sub_dir in ["Subs", "Subtitles"] {
        let candidate = dir.join(sub_dir);
        if candidate.is_dir() {
            dirs.push(candidate);
        }
    }
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                push(&path);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitles::SubtitleKind;

    #[test]
    fn declared_sidecars_are_classified_per_kind() {
        let video = Path::new("/m/Show/S01/Show.S01E02.mkv");
        let declared = vec![
            PathBuf::from("/m/Show/S01/Show.S01E02.en.srt"),
            PathBuf::from("/m/Show/S01/Show.S01E02.en.forced.srt"),
            PathBuf::from("/m/Show/S01/Show.S01E02.nfo"),
        ];
        let observed = observed_subtitles(video, &declared);
        assert_eq!(observed.len(), 2);
        assert!(observed
            .iter()
            .any(|o| o.language == "en" && o.kind == SubtitleKind::Full));
        assert!(observed
            .iter()
            .any(|o| o.language == "en" && o.kind == SubtitleKind::Forced));
    }

    #[test]
    fn directory_scan_picks_up_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("Movie.2020.mkv");
        std::fs::write(&video, b"").unwrap();
        std::fs::write(dir.path().join("Movie.2020.en.srt"), b"").unwrap();
        std::fs::write(dir.path().join("Movie.2020.de.forced.srt"), b"").unwrap();
        std::fs::write(dir.path().join("Other.2020.en.srt"), b"").unwrap();

        let observed = observed_subtitles(&video, &[]);
        assert_eq!(observed.len(), 2);
    }
}
