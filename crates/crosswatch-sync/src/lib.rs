//! Per-site controller state machine and multi-site fan-out orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crosswatch_client::{ApiError, ClientConfig, HttpSiteApi, SiteApi, WatchlistQuery};
use crosswatch_core::{Entry, RawChangeRecord, Settings, TagNameMap};
use crosswatch_pipeline::{build_entries, normalize, Linker, WikibaseResolver};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crosswatch-sync";

/// Live-mode poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(7_500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Watch,
    Unwatch,
}

/// Owns one remote site: drives paginated fetches through the pipeline,
/// caches tag names across cycles, and applies optimistic local updates for
/// user actions.
pub struct SiteController {
    site_id: String,
    api: Arc<dyn SiteApi>,
    linker: Linker,
    is_wikibase: bool,
    tag_names: Option<TagNameMap>,
    is_empty: bool,
    has_error: bool,
    entries: Vec<Entry>,
}

impl SiteController {
    pub fn new(site_id: impl Into<String>, api: Arc<dyn SiteApi>, is_wikibase: bool) -> Self {
        let site_id = site_id.into();
        let linker = Linker::new(site_id.clone());
        Self {
            site_id,
            api,
            linker,
            is_wikibase,
            tag_names: None,
            is_empty: false,
            has_error: false,
            entries: Vec::new(),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Last fetch succeeded with no rows. Independent of [`has_error`]:
    /// a failed fetch also has no rows but must never read as "empty".
    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    /// Last fetch failed. The site contributes zero entries this cycle.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Walk the continuation chain to exhaustion, concatenating slices in
    /// request order. An explicit loop rather than recursion; termination
    /// is the absence of a continuation token.
    async fn fetch_all_pages(
        &self,
        query: &WatchlistQuery,
    ) -> Result<Vec<RawChangeRecord>, ApiError> {
        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let slice = self
                .api
                .watchlist_slice(query, continuation.as_deref())
                .await?;
            records.extend(slice.records);
            match slice.continuation {
                Some(token) => {
                    debug!(site = %self.site_id, "continuing watchlist chain");
                    continuation = Some(token);
                }
                None => break,
            }
        }
        Ok(records)
    }

    /// Fetch the tag-name map once; later cycles reuse the cache.
    async fn ensure_tag_names(&mut self) -> Result<TagNameMap, ApiError> {
        if self.tag_names.is_none() {
            self.tag_names = Some(self.api.tag_display_names().await?);
        }
        Ok(self.tag_names.clone().expect("tag cache just populated"))
    }

    /// One full fetch cycle. Any failure along the chain resolves into the
    /// sticky error flag; the method itself never fails, so a multi-site
    /// fan-out cannot short-circuit on one bad source.
    pub async fn refresh(&mut self, settings: &Settings) {
        let query = WatchlistQuery::from_settings(settings);
        let outcome = self.refresh_inner(settings, &query).await;
        match outcome {
            Ok(entries) => {
                self.is_empty = entries.is_empty();
                self.has_error = false;
                self.entries = entries;
            }
            Err(err) => {
                warn!(site = %self.site_id, %err, "watchlist refresh failed");
                self.entries.clear();
                self.has_error = true;
                self.is_empty = false;
            }
        }
    }

    async fn refresh_inner(
        &mut self,
        settings: &Settings,
        query: &WatchlistQuery,
    ) -> Result<Vec<Entry>, ApiError> {
        let raw = self.fetch_all_pages(query).await?;
        // Tag names must be resolved before finalization can render tag
        // identifiers; fast mode skips both.
        let tag_names = if settings.fast_mode {
            TagNameMap::new()
        } else {
            self.ensure_tag_names().await?
        };
        let mut entries = build_entries(
            normalize(raw),
            &self.linker,
            &tag_names,
            settings.group_pages,
            Utc::now(),
        );
        if self.is_wikibase && !settings.fast_mode {
            let resolver = WikibaseResolver::new(
                self.api.clone(),
                settings.language.clone(),
                settings.wikibase_namespaces.iter().copied(),
            );
            // Enrichment only: a failed label lookup leaves bare titles
            // rather than failing the cycle.
            if let Err(err) = resolver.resolve(&mut entries).await {
                warn!(site = %self.site_id, %err, "label resolution failed");
            }
        }
        Ok(entries)
    }

    fn apply_watch_toggle(&mut self, title: &str, action: WatchAction) {
        for entry in &mut self.entries {
            if entry.common.title == title {
                entry.watched = action == WatchAction::Watch;
            }
        }
    }

    /// Toggle watch state for a title. The local update lands first, before
    /// the remote mutation resolves; a remote failure is logged but never
    /// rolled back. Outside fast mode the talk/subject counterpart gets the
    /// same treatment once its lookup resolves.
    pub async fn change_watched(&mut self, title: &str, action: WatchAction, settings: &Settings) {
        self.apply_watch_toggle(title, action);
        if let Err(err) = self
            .api
            .set_watched(title, action == WatchAction::Watch)
            .await
        {
            warn!(site = %self.site_id, title, %err, "watch mutation failed, local state kept");
        }
        if !settings.fast_mode {
            match self.api.associated_page(title).await {
                Ok(Some(associated)) => self.apply_watch_toggle(&associated, action),
                Ok(None) => {}
                Err(err) => {
                    warn!(site = %self.site_id, title, %err, "associated page lookup failed");
                }
            }
        }
    }

    /// Drop a title's entries locally, then fire the remote mutation.
    pub async fn mark_page_as_seen(&mut self, title: &str) {
        self.entries.retain(|entry| entry.common.title != title);
        self.is_empty = self.entries.is_empty();
        if let Err(err) = self.api.mark_seen(Some(title)).await {
            warn!(site = %self.site_id, title, %err, "mark-seen mutation failed, local state kept");
        }
    }

    /// Clear the whole site locally, then fire the remote mutation.
    pub async fn mark_all_as_seen(&mut self) {
        self.entries.clear();
        self.is_empty = true;
        if let Err(err) = self.api.mark_seen(None).await {
            warn!(site = %self.site_id, %err, "mark-seen mutation failed, local state kept");
        }
    }
}

/// Completion report for one fan-out refresh cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: usize,
    pub total_entries: usize,
    pub sites_with_errors: Vec<String>,
    pub empty_sites: usize,
}

/// Read-only view of one site's display state for the consuming layer.
#[derive(Debug, Clone, Serialize)]
pub struct SiteView {
    pub site: String,
    pub has_error: bool,
    pub is_empty: bool,
    pub entries: Vec<Entry>,
}

/// Fans fetch and mark-seen operations out across every configured site
/// concurrently. Per-site failures land as flags on the site's state, so
/// the settle-all join can never short-circuit.
pub struct MultiSiteSync {
    sites: Vec<Arc<Mutex<SiteController>>>,
    settings: Settings,
}

impl MultiSiteSync {
    pub fn new(settings: Settings, controllers: Vec<SiteController>) -> Self {
        Self {
            sites: controllers
                .into_iter()
                .map(|controller| Arc::new(Mutex::new(controller)))
                .collect(),
            settings,
        }
    }

    /// Build one HTTP-backed controller per configured site.
    pub fn from_settings(settings: Settings, config: ClientConfig) -> anyhow::Result<Self> {
        let mut controllers = Vec::with_capacity(settings.sites.len());
        for site in &settings.sites {
            let api = HttpSiteApi::new(site.clone(), config.clone())?;
            controllers.push(SiteController::new(
                site.clone(),
                Arc::new(api),
                settings.is_wikibase_site(site),
            ));
        }
        Ok(Self::new(settings, controllers))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sites(&self) -> &[Arc<Mutex<SiteController>>] {
        &self.sites
    }

    /// Refresh every site concurrently and wait for all of them to settle.
    /// The per-site mutex doubles as the in-flight guard: a site can never
    /// run two overlapping fetch chains.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("refresh_cycle", %run_id);

        let settings = &self.settings;
        async {
            join_all(self.sites.iter().map(|site| async move {
                site.lock().await.refresh(settings).await;
            }))
            .await;
        }
        .instrument(span)
        .await;

        let mut total_entries = 0;
        let mut sites_with_errors = Vec::new();
        let mut empty_sites = 0;
        for site in &self.sites {
            let controller = site.lock().await;
            total_entries += controller.entries().len();
            if controller.has_error() {
                sites_with_errors.push(controller.site_id().to_string());
            }
            if controller.is_empty() {
                empty_sites += 1;
            }
        }

        RefreshSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sites: self.sites.len(),
            total_entries,
            sites_with_errors,
            empty_sites,
        }
    }

    /// Mark every site's watchlist as seen, fan-out-concurrent, aggregated
    /// into one completion.
    pub async fn mark_all_as_seen(&self) {
        join_all(self.sites.iter().map(|site| async move {
            site.lock().await.mark_all_as_seen().await;
        }))
        .await;
    }

    /// Current display state of every site, in configuration order.
    pub async fn snapshot(&self) -> Vec<SiteView> {
        let mut views = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            let controller = site.lock().await;
            views.push(SiteView {
                site: controller.site_id().to_string(),
                has_error: controller.has_error(),
                is_empty: controller.is_empty(),
                entries: controller.entries().to_vec(),
            });
        }
        views
    }

    /// Poll on the fixed interval while the consuming view is visible.
    /// Hidden periods suspend the loop entirely (no remote calls, no
    /// accumulated ticks); dropping the visibility sender stops it.
    pub async fn run_live(&self, mut visible: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            while !*visible.borrow() {
                if visible.changed().await.is_err() {
                    return;
                }
                ticker.reset();
            }
            let summary = self.refresh_all().await;
            debug!(
                entries = summary.total_entries,
                errors = summary.sites_with_errors.len(),
                "live refresh settled"
            );
        }
    }
}
