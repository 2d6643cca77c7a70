use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppError,
    db::DbLanguageProfile,
    subtitles::SubtitleKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcedPreference {
    #[default]
    Disabled,
    /// Always keep a separate forced track next to the full one.
    Separate,
    /// Forced track only when the media's embedded streams indicate
    /// foreign-language content.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileLanguage {
    pub code: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hearing_impaired: bool,
    #[serde(default)]
    pub forced_preference: ForcedPreference,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguageProfile {
    pub id: i64,
    pub name: String,
    pub languages: Vec<ProfileLanguage>,
    pub acceptance_threshold: i64,
    pub upgrade_threshold: i64,
}

impl LanguageProfile {
    pub fn from_db(row: &DbLanguageProfile) -> Result<Self, AppError> {
        let languages: Vec<ProfileLanguage> = serde_json::from_str(&row.languages)
            .map_err(|e| AppError::internal_error(format!("corrupt profile languages: {e}")))?;
        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            languages,
            acceptance_threshold: row.acceptance_threshold,
            upgrade_threshold: row.upgrade_threshold,
        })
    }

    pub fn language(&self, code: &str) -> Option<&ProfileLanguage> {
        self.languages.iter().find(|l| l.code == code)
    }

    pub fn hearing_impaired_wanted(&self, code: &str) -> bool {
        self.language(code).map(|l| l.hearing_impaired).unwrap_or(false)
    }
}

/// Embedded subtitle stream metadata as reported by the library manager or
/// a probe of the container. Dispositions are advisory, not ground truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddedStream {
    pub language: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub forced_disposition: bool,
    pub codec: Option<String>,
}

impl EmbeddedStream {
    fn hints_foreign_content(&self) -> bool {
        if self.forced_disposition {
            return true;
        }
        self.title
            .as_deref()
            .map(|t| {
                let t = t.to_lowercase();
                t.contains("forced") || t.contains("signs")
            })
            .unwrap_or(false)
    }
}

/// The set of `(language, kind)` tracks the profile requires for a media
/// item. Pure function of its inputs.
pub fn required_tracks(
    embedded_streams: &[EmbeddedStream],
    profile: &LanguageProfile,
) -> BTreeSet<(String, SubtitleKind)> {
    let mut tracks = BTreeSet::new();
    let foreign_content = embedded_streams.iter().any(|s| s.hints_foreign_content());
    for language in profile.languages.iter().filter(|l| l.enabled) {
        let code = language.code.to_lowercase();
        tracks.insert((code.clone(), SubtitleKind::Full));
        match language.forced_preference {
            ForcedPreference::Disabled => {}
            ForcedPreference::Separate => {
                tracks.insert((code, SubtitleKind::Forced));
            }
            ForcedPreference::Auto => {
                if foreign_content {
                    tracks.insert((code, SubtitleKind::Forced));
                }
            }
        }
    }
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(languages: Vec<ProfileLanguage>) -> LanguageProfile {
        LanguageProfile {
            id: 1,
            name: "Test".into(),
            languages,
            acceptance_threshold: 60,
            upgrade_threshold: 80,
        }
    }

    fn lang(code: &str, forced: ForcedPreference) -> ProfileLanguage {
        ProfileLanguage {
            code: code.into(),
            enabled: true,
            hearing_impaired: false,
            forced_preference: forced,
        }
    }

    #[test]
    fn empty_profile_requires_nothing() {
        let p = profile(vec![]);
        assert!(required_tracks(&[], &p).is_empty());
    }

    #[test]
    fn separate_preference_emits_both_tracks() {
        let p = profile(vec![lang("en", ForcedPreference::Separate)]);
        let tracks = required_tracks(&[], &p);
        assert!(tracks.contains(&("en".into(), SubtitleKind::Full)));
        assert!(tracks.contains(&("en".into(), SubtitleKind::Forced)));
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn auto_preference_needs_stream_hint() {
        let p = profile(vec![lang("en", ForcedPreference::Auto)]);
        assert_eq!(required_tracks(&[], &p).len(), 1);

        let streams = vec![EmbeddedStream {
            language: Some("jpn".into()),
            title: Some("Signs & Songs".into()),
            forced_disposition: false,
            codec: Some("ass".into()),
        }];
        let tracks = required_tracks(&streams, &p);
        assert!(tracks.contains(&("en".into(), SubtitleKind::Forced)));
    }

    #[test]
    fn disabled_languages_are_skipped() {
        let mut disabled = lang("de", ForcedPreference::Separate);
        disabled.enabled = false;
        let p = profile(vec![lang("en", ForcedPreference::Disabled), disabled]);
        let tracks = required_tracks(&[], &p);
        assert_eq!(tracks.len(), 1);
        assert!(tracks.contains(&("en".into(), SubtitleKind::Full)));
    }

    #[test]
    fn profile_parses_from_db_row() {
        let row = crate::db::DbLanguageProfile {
            id: 3,
            name: "Anime".into(),
            languages: r#"[{"code":"en","forced_preference":"auto"},{"code":"de","enabled":false}]"#
                .into(),
            acceptance_threshold: 70,
            upgrade_threshold: 90,
            created_at: 0,
        };
        let profile = LanguageProfile::from_db(&row).unwrap();
        assert_eq!(profile.languages.len(), 2);
        assert!(profile.languages[0].enabled);
        assert_eq!(
            profile.languages[0].forced_preference,
            ForcedPreference::Auto
        );
        assert!(!profile.languages[1].enabled);
    }
}
