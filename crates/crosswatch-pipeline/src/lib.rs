//! Pure transformation pipeline: raw change records in, display-ready
//! entries out. Also hosts the optional wikibase label enrichment, which is
//! the one step that reaches back through the `SiteApi` seam.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crosswatch_client::{ApiError, SiteApi, LABEL_BATCH_LIMIT};
use crosswatch_core::{
    ChangeKind, Entry, EntryCommon, EntryKind, NormalizedChange, RawChangeRecord, TagNameMap,
    HIDDEN_USER,
};

pub const CRATE_NAME: &str = "crosswatch-pipeline";

/// Tooltip attached to merged edit groups, explaining that the shown
/// timestamp is the newest of several.
pub const GROUPED_TIMESTAMP_TOOLTIP: &str = "Timestamp of the latest change in this group";

const HIDDEN_USER_PLACEHOLDER: &str = r#"<span class="crosswatch-user-hidden">user hidden</span>"#;

/// Builds absolute URLs into one remote site and rewrites site-relative
/// hyperlinks in server-supplied HTML fragments.
#[derive(Debug, Clone)]
pub struct Linker {
    site: String,
}

impl Linker {
    pub fn new(site: impl Into<String>) -> Self {
        Self { site: site.into() }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn page_url(&self, title: &str) -> String {
        format!("https://{}/wiki/{}", self.site, encode_title(title))
    }

    pub fn user_url(&self, name: &str) -> String {
        self.page_url(&format!("User:{name}"))
    }

    pub fn contributions_url(&self, name: &str) -> String {
        self.page_url(&format!("Special:Contributions/{name}"))
    }

    /// Rewrite `href="/…"` attributes to absolute links against this site.
    /// Protocol-relative (`href="//…"`) and already-absolute hrefs pass
    /// through untouched, as does all other text.
    pub fn fix_local_links(&self, html: &str) -> String {
        const NEEDLE: &str = "href=\"/";
        let mut out = String::with_capacity(html.len());
        let mut rest = html;
        while let Some(pos) = rest.find(NEEDLE) {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + NEEDLE.len()..];
            if after.starts_with('/') {
                out.push_str(NEEDLE);
            } else {
                out.push_str("href=\"https://");
                out.push_str(&self.site);
                out.push('/');
            }
            rest = after;
        }
        out.push_str(rest);
        out
    }
}

fn encode_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.chars() {
        match ch {
            ' ' => out.push('_'),
            '"' => out.push_str("%22"),
            '%' => out.push_str("%25"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            _ => out.push(ch),
        }
    }
    out
}

/// Resolve every optional raw field to a stable value. Page creations fold
/// into edits with `new_page = true`; a redacted user becomes the
/// [`HIDDEN_USER`] sentinel, an unfetched user the empty string.
pub fn normalize(raw: Vec<RawChangeRecord>) -> Vec<NormalizedChange> {
    raw.into_iter().map(normalize_record).collect()
}

fn normalize_record(record: RawChangeRecord) -> NormalizedChange {
    let user = if record.userhidden {
        HIDDEN_USER.to_string()
    } else {
        record.user.unwrap_or_default()
    };
    let kind = match record.change_type.as_str() {
        "new" => ChangeKind::Edit { new_page: true },
        "log" => ChangeKind::Log,
        _ => ChangeKind::Edit { new_page: false },
    };
    NormalizedChange {
        page_id: record.pageid,
        namespace: record.ns,
        title: record.title,
        kind,
        user,
        anon: record.anon,
        bot: record.bot,
        minor: record.minor,
        timestamp: record.timestamp,
        comment: record.parsedcomment.unwrap_or_default(),
        tags: record.tags.unwrap_or_default(),
        old_revid: record.old_revid,
        revid: record.revid,
        expiry: record.expiry,
        log_id: record.logid,
        log_action: record.logaction,
        log_type: record.logtype,
    }
}

/// Edit records for one page within a single fetch cycle, in arrival order.
#[derive(Debug, Clone)]
pub struct PageEditGroup {
    pub page_id: u64,
    pub namespace: i64,
    pub title: String,
    pub edits: Vec<NormalizedChange>,
}

fn partition(changes: Vec<NormalizedChange>) -> (Vec<PageEditGroup>, Vec<NormalizedChange>) {
    let mut groups: Vec<PageEditGroup> = Vec::new();
    let mut index: HashMap<u64, usize> = HashMap::new();
    let mut logs = Vec::new();
    for change in changes {
        match change.kind {
            ChangeKind::Log => logs.push(change),
            ChangeKind::Edit { .. } => match index.get(&change.page_id) {
                Some(&slot) => groups[slot].edits.push(change),
                None => {
                    index.insert(change.page_id, groups.len());
                    groups.push(PageEditGroup {
                        page_id: change.page_id,
                        namespace: change.namespace,
                        title: change.title.clone(),
                        edits: vec![change],
                    });
                }
            },
        }
    }
    (groups, logs)
}

/// An entry before the finalization pass: flag inputs, raw comment, and raw
/// tag identifiers still attached.
#[derive(Debug, Clone)]
struct DraftEntry {
    kind: EntryKind,
    title: String,
    namespace: i64,
    timestamp: Option<String>,
    timestamp_tooltip: Option<String>,
    user_display: String,
    comment: Option<String>,
    tags: Vec<String>,
    expiry: Option<String>,
    bot: bool,
    minor: bool,
    new_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEdits {
    pub name: String,
    pub count: usize,
    pub anon: bool,
}

fn per_user_counts(edits: &[NormalizedChange]) -> Vec<UserEdits> {
    let mut users: Vec<UserEdits> = Vec::new();
    for edit in edits {
        match users.iter_mut().find(|u| u.name == edit.user) {
            Some(existing) => existing.count += 1,
            None => users.push(UserEdits {
                name: edit.user.clone(),
                count: 1,
                anon: edit.anon,
            }),
        }
    }
    users
}

/// Render the attribution link for a single user. Empty input means no user
/// was fetched at all (fast mode) and yields an empty string; the hidden
/// sentinel yields a fixed placeholder span instead of a link.
pub fn single_user_link(linker: &Linker, user: &str, is_anon: bool) -> String {
    if user.is_empty() {
        return String::new();
    }
    if user == HIDDEN_USER {
        return HIDDEN_USER_PLACEHOLDER.to_string();
    }
    let href = if is_anon {
        linker.contributions_url(user)
    } else {
        linker.user_url(user)
    };
    format!(r#"<a href="{href}">{user}</a>"#)
}

/// Render attribution for a merged group: one link per distinct user in
/// first-seen order, each annotated with its edit count when above one.
pub fn render_user_links(linker: &Linker, users: &[UserEdits]) -> String {
    users
        .iter()
        .filter(|user| !user.name.is_empty())
        .map(|user| {
            let link = single_user_link(linker, &user.name, user.anon);
            if user.count > 1 {
                format!("{link} ×{}", user.count)
            } else {
                link
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_timestamp(timestamp: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = timestamp?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Collapse a multi-edit group into one draft. AND for bot/minor (one
/// non-bot edit unflags the group), OR for page creation, revision range
/// spans oldest baseline to newest result, timestamp is the latest in the
/// group. Grouped entries carry no single comment and no tag detail.
fn merge_page_edits(group: &PageEditGroup, linker: &Linker) -> DraftEntry {
    assert!(
        group.edits.len() >= 2,
        "merge requires a group of at least two edits"
    );
    let bot = group.edits.iter().all(|e| e.bot);
    let minor = group.edits.iter().all(|e| e.minor);
    let new_page = group
        .edits
        .iter()
        .any(|e| matches!(e.kind, ChangeKind::Edit { new_page: true }));
    let from_revision = group
        .edits
        .iter()
        .map(|e| e.old_revid)
        .min()
        .expect("non-empty group");
    let to_revision = group
        .edits
        .iter()
        .map(|e| e.revid)
        .max()
        .expect("non-empty group");
    let timestamp = group
        .edits
        .iter()
        .max_by_key(|e| parse_timestamp(e.timestamp.as_deref()))
        .and_then(|e| e.timestamp.clone());

    DraftEntry {
        kind: EntryKind::Edits {
            from_revision,
            to_revision,
            new_page,
            edit_count: group.edits.len(),
        },
        title: group.title.clone(),
        namespace: group.namespace,
        timestamp,
        timestamp_tooltip: Some(GROUPED_TIMESTAMP_TOOLTIP.to_string()),
        user_display: render_user_links(linker, &per_user_counts(&group.edits)),
        comment: None,
        tags: Vec::new(),
        expiry: group.edits.first().and_then(|e| e.expiry.clone()),
        bot,
        minor,
        new_page,
    }
}

fn single_edit_draft(edit: &NormalizedChange, linker: &Linker) -> DraftEntry {
    let new_page = matches!(edit.kind, ChangeKind::Edit { new_page: true });
    DraftEntry {
        kind: EntryKind::Edits {
            from_revision: edit.old_revid,
            to_revision: edit.revid,
            new_page,
            edit_count: 1,
        },
        title: edit.title.clone(),
        namespace: edit.namespace,
        timestamp: edit.timestamp.clone(),
        timestamp_tooltip: None,
        user_display: single_user_link(linker, &edit.user, edit.anon),
        comment: Some(edit.comment.clone()),
        tags: edit.tags.clone(),
        expiry: edit.expiry.clone(),
        bot: edit.bot,
        minor: edit.minor,
        new_page,
    }
}

fn log_draft(log: &NormalizedChange, linker: &Linker) -> DraftEntry {
    DraftEntry {
        kind: EntryKind::Log {
            log_id: log.log_id,
            log_action: log.log_action.clone(),
            log_type: log.log_type.clone(),
        },
        title: log.title.clone(),
        namespace: log.namespace,
        timestamp: log.timestamp.clone(),
        timestamp_tooltip: None,
        user_display: single_user_link(linker, &log.user, log.anon),
        comment: Some(log.comment.clone()),
        tags: log.tags.clone(),
        expiry: log.expiry.clone(),
        bot: log.bot,
        minor: log.minor,
        new_page: false,
    }
}

fn tiebreak_key(kind: &EntryKind) -> u64 {
    match kind {
        EntryKind::Edits { to_revision, .. } => *to_revision,
        EntryKind::Log { log_id, .. } => *log_id,
    }
}

/// Descending by full-precision timestamp (unknown = oldest), then by
/// revision/log id descending for same-instant entries. Runs before
/// timestamp truncation, which would destroy the precision needed here.
fn sort_drafts(drafts: &mut [DraftEntry]) {
    drafts.sort_by(|a, b| {
        let a_ts = parse_timestamp(a.timestamp.as_deref());
        let b_ts = parse_timestamp(b.timestamp.as_deref());
        b_ts.cmp(&a_ts).then(tiebreak_key(&b.kind).cmp(&tiebreak_key(&a.kind)))
    });
}

fn render_flags(new_page: bool, minor: bool, bot: bool) -> Option<String> {
    let mut flags = String::new();
    if new_page {
        flags.push('N');
    }
    if minor {
        flags.push('m');
    }
    if bot {
        flags.push('b');
    }
    if flags.is_empty() {
        None
    } else {
        Some(flags)
    }
}

fn truncate_timestamp(timestamp: Option<String>) -> Option<String> {
    let raw = timestamp?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(parsed) => Some(parsed.format("%Y-%m-%d %H:%M").to_string()),
        Err(_) => Some(raw),
    }
}

fn render_expiry(expiry: Option<&str>, now: DateTime<Utc>) -> Option<String> {
    let instant = parse_timestamp(expiry)?;
    let millis = (instant - now).num_milliseconds();
    let days = (millis as f64 / 86_400_000.0).ceil() as i64;
    // A stale row can carry an expiry already in the past; never render a
    // negative day count.
    if days <= 0 {
        Some("Watch expires within hours".to_string())
    } else if days == 1 {
        Some("Watch expires in 1 day".to_string())
    } else {
        Some(format!("Watch expires in {days} days"))
    }
}

fn render_tags(tags: &[String], tag_names: &TagNameMap) -> Option<String> {
    // An empty map means tag names were never fetched (fast mode).
    if tags.is_empty() || tag_names.is_empty() {
        return None;
    }
    let names = tags
        .iter()
        .map(|tag| {
            tag_names
                .get(tag)
                .and_then(|display| display.as_deref())
                .unwrap_or(tag.as_str())
        })
        .collect::<Vec<_>>()
        .join(", ");
    let noun = if tags.len() == 1 { "tag" } else { "tags" };
    Some(format!("({} {noun}: {names})", tags.len()))
}

fn finalize(
    drafts: Vec<DraftEntry>,
    linker: &Linker,
    tag_names: &TagNameMap,
    now: DateTime<Utc>,
) -> Vec<Entry> {
    drafts
        .into_iter()
        .map(|draft| {
            let comment_display = draft
                .comment
                .filter(|comment| !comment.is_empty())
                .map(|comment| format!(": {}", linker.fix_local_links(&comment)));
            Entry {
                common: EntryCommon {
                    timestamp: truncate_timestamp(draft.timestamp),
                    timestamp_tooltip: draft.timestamp_tooltip,
                    expiry_display: render_expiry(draft.expiry.as_deref(), now),
                    flags: render_flags(draft.new_page, draft.minor, draft.bot),
                    user_display: draft.user_display,
                    display_title: draft.title.clone(),
                    title: draft.title,
                    namespace: draft.namespace,
                    comment_display,
                    tags_display: render_tags(&draft.tags, tag_names),
                },
                kind: draft.kind,
                watched: true,
            }
        })
        .collect()
}

/// Run the full pipeline over one site's normalized records: group, merge,
/// sort (edits and log actions independently, edits first), then finalize
/// display fields.
pub fn build_entries(
    changes: Vec<NormalizedChange>,
    linker: &Linker,
    tag_names: &TagNameMap,
    group_pages: bool,
    now: DateTime<Utc>,
) -> Vec<Entry> {
    let (groups, logs) = partition(changes);

    let mut edit_drafts = Vec::new();
    for group in &groups {
        if group_pages && group.edits.len() >= 2 {
            edit_drafts.push(merge_page_edits(group, linker));
        } else {
            edit_drafts.extend(group.edits.iter().map(|edit| single_edit_draft(edit, linker)));
        }
    }
    let mut log_drafts: Vec<DraftEntry> = logs.iter().map(|log| log_draft(log, linker)).collect();

    sort_drafts(&mut edit_drafts);
    sort_drafts(&mut log_drafts);

    let mut drafts = edit_drafts;
    drafts.append(&mut log_drafts);
    finalize(drafts, linker, tag_names, now)
}

/// Extract a structured-data entity id from a page title, stripping any
/// namespace prefix (`Property:P31` -> `P31`). Returns `None` for titles
/// that are not well-formed entity ids.
pub fn entity_id_from_title(title: &str) -> Option<String> {
    let id = title.rsplit(':').next().unwrap_or(title);
    let mut chars = id.chars();
    match chars.next() {
        Some('Q') | Some('P') | Some('L') => {}
        _ => return None,
    }
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(id.to_string())
}

/// Batch-resolves entity ids appearing in entry titles to human-readable
/// labels for the one site designated as the structured-data source.
pub struct WikibaseResolver {
    api: Arc<dyn SiteApi>,
    language: String,
    namespaces: HashSet<i64>,
}

impl WikibaseResolver {
    pub fn new(
        api: Arc<dyn SiteApi>,
        language: impl Into<String>,
        namespaces: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            api,
            language: language.into(),
            namespaces: namespaces.into_iter().collect(),
        }
    }

    /// Extend `display_title` with a parenthetical label for every entry in
    /// a labelable namespace. Ids are deduped before fetching, fetched in
    /// sequential batches, and applied to all matching entries; entities
    /// without a label in the configured language stay unchanged.
    pub async fn resolve(&self, entries: &mut [Entry]) -> Result<(), ApiError> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        for entry in entries.iter() {
            if let Some(id) = self.entry_id(entry) {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        if ids.is_empty() {
            return Ok(());
        }

        // Batch completion order does not matter: the union is commutative.
        let mut labels = HashMap::new();
        for batch in ids.chunks(LABEL_BATCH_LIMIT) {
            labels.extend(self.api.entity_labels(batch, &self.language).await?);
        }

        for entry in entries.iter_mut() {
            let Some(id) = self.entry_id(entry) else {
                continue;
            };
            if let Some(label) = labels.get(&id) {
                entry.common.display_title = format!("{} ({label})", entry.common.title);
            }
        }
        Ok(())
    }

    fn entry_id(&self, entry: &Entry) -> Option<String> {
        if !self.namespaces.contains(&entry.common.namespace) {
            return None;
        }
        entity_id_from_title(&entry.common.title)
    }
}
