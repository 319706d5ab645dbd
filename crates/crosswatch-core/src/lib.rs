//! Core domain model and settings for crosswatch.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "crosswatch-core";

/// Sentinel for a user attribution the remote site redacted. Contains `#`,
/// which MediaWiki forbids in usernames, so it cannot collide with a real
/// account and is distinct from `""` (user not fetched at all).
pub const HIDDEN_USER: &str = "##hidden##";

/// One row of a remote watchlist listing (formatversion=2 JSON). Fast mode
/// omits several optional fields entirely, hence the blanket defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeRecord {
    #[serde(default)]
    pub pageid: u64,
    #[serde(default)]
    pub ns: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub change_type: String,
    #[serde(default)]
    pub old_revid: u64,
    #[serde(default)]
    pub revid: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub userhidden: bool,
    #[serde(default)]
    pub anon: bool,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub minor: bool,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub parsedcomment: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub logid: u64,
    #[serde(default)]
    pub logaction: String,
    #[serde(default)]
    pub logtype: String,
}

/// Discriminant for a normalized change. Page creations are folded into
/// `Edit` with `new_page = true` during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Edit { new_page: bool },
    Log,
}

/// A raw record after normalization: every optional remote field has been
/// resolved to a type-stable value the pipeline can rely on.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedChange {
    pub page_id: u64,
    pub namespace: i64,
    pub title: String,
    pub kind: ChangeKind,
    /// `""` = not fetched (fast mode), [`HIDDEN_USER`] = redacted,
    /// anything else is a real username or IP.
    pub user: String,
    pub anon: bool,
    pub bot: bool,
    pub minor: bool,
    /// `None` = timestamp not fetched.
    pub timestamp: Option<String>,
    pub comment: String,
    pub tags: Vec<String>,
    pub old_revid: u64,
    pub revid: u64,
    pub expiry: Option<String>,
    pub log_id: u64,
    pub log_action: String,
    pub log_type: String,
}

/// Display fields shared by both entry kinds. The original system's
/// "string or false" fields map to `Option<String>` here; `None` is the
/// view layer's "nothing to show".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryCommon {
    pub timestamp: Option<String>,
    pub timestamp_tooltip: Option<String>,
    pub expiry_display: Option<String>,
    pub flags: Option<String>,
    pub user_display: String,
    pub title: String,
    pub display_title: String,
    pub namespace: i64,
    pub comment_display: Option<String>,
    pub tags_display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntryKind {
    Edits {
        from_revision: u64,
        to_revision: u64,
        new_page: bool,
        edit_count: usize,
    },
    Log {
        log_id: u64,
        log_action: String,
        log_type: String,
    },
}

/// One display-ready watchlist entry: an edit group or a log action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub common: EntryCommon,
    pub kind: EntryKind,
    /// Optimistic strike-through state: flipped locally by watch/unwatch
    /// before the remote mutation resolves.
    pub watched: bool,
}

impl Entry {
    pub fn is_edit(&self) -> bool {
        matches!(self.kind, EntryKind::Edits { .. })
    }
}

/// Tri-state inclusion filter for anonymous/bot/minor changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLevel {
    #[default]
    Either,
    Only,
    Exclude,
}

impl FilterLevel {
    /// The remote show-filter token for this level, `None` when the filter
    /// is pass-through.
    pub fn show_token(&self, name: &str) -> Option<String> {
        match self {
            FilterLevel::Either => None,
            FilterLevel::Only => Some(name.to_string()),
            FilterLevel::Exclude => Some(format!("!{name}")),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en".to_string()
}

/// User configuration consumed by the aggregation core. Supplied externally
/// as a JSON document; unknown or missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default)]
    pub anon_filter: FilterLevel,
    #[serde(default)]
    pub bot_filter: FilterLevel,
    #[serde(default)]
    pub minor_filter: FilterLevel,
    #[serde(default = "default_true")]
    pub show_edits: bool,
    #[serde(default = "default_true")]
    pub show_log_entries: bool,
    #[serde(default = "default_true")]
    pub show_new_pages: bool,
    #[serde(default = "default_true")]
    pub group_pages: bool,
    #[serde(default)]
    pub fast_mode: bool,
    #[serde(default = "default_true")]
    pub confirm_mark_all_sites: bool,
    #[serde(default = "default_language")]
    pub language: String,
    /// The one site whose titles are structured-data entity ids eligible
    /// for label enrichment.
    #[serde(default)]
    pub wikibase_site: Option<String>,
    #[serde(default)]
    pub wikibase_namespaces: Vec<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            anon_filter: FilterLevel::Either,
            bot_filter: FilterLevel::Either,
            minor_filter: FilterLevel::Either,
            show_edits: true,
            show_log_entries: true,
            show_new_pages: true,
            group_pages: true,
            fast_mode: false,
            confirm_mark_all_sites: true,
            language: default_language(),
            wikibase_site: None,
            wikibase_namespaces: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse settings from a JSON document, falling back to defaults on
    /// malformed input. The fallback is non-fatal: the fetch pipeline runs
    /// either way, the user just loses their customizations for the session.
    pub fn from_json(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(%err, "settings JSON unparsable, using defaults");
                Settings::default()
            }
        }
    }

    /// Read settings from a file, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(err) => {
                warn!(path = %path.display(), %err, "settings file unreadable, using defaults");
                Settings::default()
            }
        }
    }

    /// Whether `site` is the designated structured-data source.
    pub fn is_wikibase_site(&self, site: &str) -> bool {
        self.wikibase_site.as_deref() == Some(site)
    }
}

/// Tag identifier -> optional display name, as returned by the remote tag
/// listing. `None` means the site configured no display name and the raw
/// identifier is shown instead.
pub type TagNameMap = HashMap<String, Option<String>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn raw_record_deserializes_with_absent_optional_fields() {
        // Fast-mode payload: no user/timestamp/comment/tags.
        let record: RawChangeRecord = serde_json::from_str(
            r#"{"pageid": 5, "ns": 0, "title": "Example", "type": "edit", "old_revid": 1, "revid": 2}"#,
        )
        .expect("parse");
        assert_eq!(record.user, None);
        assert_eq!(record.timestamp, None);
        assert_eq!(record.tags, None);
        assert!(!record.userhidden);
        assert_eq!(record.logid, 0);
    }

    #[test]
    fn raw_record_deserializes_log_rows() {
        let record: RawChangeRecord = serde_json::from_str(
            r#"{"pageid": 7, "ns": 4, "title": "Project:Rules", "type": "log",
                "logid": 99, "logtype": "protect", "logaction": "protect",
                "user": "Admin", "timestamp": "2021-07-04T07:30:49Z"}"#,
        )
        .expect("parse");
        assert_eq!(record.change_type, "log");
        assert_eq!(record.logid, 99);
        assert_eq!(record.revid, 0);
    }

    #[test]
    fn filter_levels_produce_show_tokens() {
        assert_eq!(FilterLevel::Either.show_token("anon"), None);
        assert_eq!(FilterLevel::Only.show_token("anon"), Some("anon".to_string()));
        assert_eq!(FilterLevel::Exclude.show_token("bot"), Some("!bot".to_string()));
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let settings = Settings::from_json("{not json");
        assert_eq!(settings, Settings::default());
        assert!(settings.group_pages);
        assert!(!settings.fast_mode);
    }

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let settings = Settings::load("/nonexistent/crosswatch-settings.json");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_settings_keep_defaults_for_absent_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"sites": ["en.wikipedia.org"], "fast_mode": true, "anon_filter": "exclude"}}"#
        )
        .expect("write");
        let settings = Settings::load(file.path());
        assert_eq!(settings.sites, vec!["en.wikipedia.org".to_string()]);
        assert!(settings.fast_mode);
        assert_eq!(settings.anon_filter, FilterLevel::Exclude);
        assert!(settings.show_edits);
        assert_eq!(settings.language, "en");
    }

    #[test]
    fn wikibase_site_designation() {
        let settings = Settings {
            wikibase_site: Some("www.wikidata.org".to_string()),
            ..Settings::default()
        };
        assert!(settings.is_wikibase_site("www.wikidata.org"));
        assert!(!settings.is_wikibase_site("en.wikipedia.org"));
    }
}
