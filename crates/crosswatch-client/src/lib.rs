//! Remote wiki API surface: the `SiteApi` seam plus its reqwest-backed
//! implementation with retry classification.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crosswatch_core::{RawChangeRecord, Settings};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "crosswatch-client";

/// Anonymous CSRF token accepted by the remote mutation endpoints.
/// Session handling is out of scope, so every mutation sends this.
const ANON_TOKEN: &str = "+\\";

/// Label-bearing batches are capped by the remote endpoint.
pub const LABEL_BATCH_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("remote api error {code}: {info}")]
    Api { code: String, info: String },
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff for transient failures within a single page request.
/// Pagination chains are never retried as a whole; a failed chain surfaces
/// as the site's error flag.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Query parameters for one watchlist listing chain, derived once per
/// refresh cycle from the user's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchlistQuery {
    /// `edit|new|log` style result-type filter.
    pub type_filter: String,
    /// Property-set selector; reduced in fast mode.
    pub props: String,
    /// `name` / `!name` show-filter tokens joined with `|`; empty when all
    /// filters are pass-through.
    pub show: String,
}

impl WatchlistQuery {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut types = Vec::new();
        if settings.show_edits {
            types.push("edit");
        }
        if settings.show_new_pages {
            types.push("new");
        }
        if settings.show_log_entries {
            types.push("log");
        }

        let mut props = vec!["ids", "title", "flags", "loginfo", "expiry"];
        if !settings.fast_mode {
            props.extend(["user", "parsedcomment", "timestamp", "tags"]);
        }

        let show = [
            settings.anon_filter.show_token("anon"),
            settings.bot_filter.show_token("bot"),
            settings.minor_filter.show_token("minor"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("|");

        Self {
            type_filter: types.join("|"),
            props: props.join("|"),
            show,
        }
    }
}

/// One page of a watchlist listing: the rows plus the continuation cursor,
/// absent on the final page.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchlistSlice {
    pub records: Vec<RawChangeRecord>,
    pub continuation: Option<String>,
}

/// Everything the aggregation core needs from one remote site. Implemented
/// over HTTP in production and by in-memory doubles in tests.
#[async_trait]
pub trait SiteApi: Send + Sync {
    /// Fetch one page of the recent-changes watchlist listing.
    async fn watchlist_slice(
        &self,
        query: &WatchlistQuery,
        continuation: Option<&str>,
    ) -> Result<WatchlistSlice, ApiError>;

    /// Tag identifier -> optional display name for the whole site.
    async fn tag_display_names(&self) -> Result<HashMap<String, Option<String>>, ApiError>;

    /// Batched entity-id -> label lookup, language-scoped. Ids without a
    /// label in `language` are simply absent from the result.
    async fn entity_labels(
        &self,
        ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, String>, ApiError>;

    /// Watch (`true`) or unwatch (`false`) a page by title.
    async fn set_watched(&self, title: &str, watch: bool) -> Result<(), ApiError>;

    /// Reset the notification timestamp for one title, or for the entire
    /// watchlist when `title` is `None`.
    async fn mark_seen(&self, title: Option<&str>) -> Result<(), ApiError>;

    /// The talk/subject counterpart of a page, if the site reports one.
    async fn associated_page(&self, title: &str) -> Result<Option<String>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "crosswatch/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// `SiteApi` over a site's `api.php` endpoint.
#[derive(Debug)]
pub struct HttpSiteApi {
    site: String,
    endpoint: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpSiteApi {
    pub fn new(site: impl Into<String>, config: ClientConfig) -> anyhow::Result<Self> {
        let site = site.into();
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        let endpoint = format!("https://{site}/w/api.php");
        Ok(Self {
            site,
            endpoint,
            client,
            backoff: config.backoff,
        })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    async fn request_json(
        &self,
        params: &[(&str, &str)],
        post: bool,
    ) -> Result<Value, ApiError> {
        let mut attempt = 0;
        loop {
            let request = if post {
                self.client.post(&self.endpoint).form(params)
            } else {
                self.client.get(&self.endpoint).query(params)
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let value: Value = resp.json().await?;
                        check_api_error(&value)?;
                        return Ok(value);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, url = %final_url, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(ApiError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Request(err));
                }
            }
        }
    }
}

fn check_api_error(value: &Value) -> Result<(), ApiError> {
    if let Some(error) = value.get("error") {
        return Err(ApiError::Api {
            code: error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            info: error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(())
}

fn parse_watchlist_slice(value: &Value) -> Result<WatchlistSlice, ApiError> {
    let rows = value
        .get("query")
        .and_then(|q| q.get("watchlist"))
        .ok_or_else(|| ApiError::Shape("missing query.watchlist".to_string()))?;
    let records: Vec<RawChangeRecord> = serde_json::from_value(rows.clone())
        .map_err(|err| ApiError::Shape(format!("watchlist rows: {err}")))?;
    let continuation = value
        .get("continue")
        .and_then(|c| c.get("wlcontinue"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    Ok(WatchlistSlice {
        records,
        continuation,
    })
}

fn parse_tag_names(value: &Value) -> Result<HashMap<String, Option<String>>, ApiError> {
    let rows = value
        .get("query")
        .and_then(|q| q.get("tags"))
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::Shape("missing query.tags".to_string()))?;
    let mut map = HashMap::new();
    for row in rows {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            continue;
        };
        let display = row
            .get("displayname")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        map.insert(name.to_string(), display);
    }
    Ok(map)
}

/// Pull per-entity labels out of a `wbgetentities` response. Lexemes carry
/// their human-readable name under `lemmas`; every other entity type uses
/// `labels`. Entities without a value in `language` are skipped.
fn parse_entity_labels(value: &Value, language: &str) -> Result<HashMap<String, String>, ApiError> {
    let entities = value
        .get("entities")
        .and_then(Value::as_object)
        .ok_or_else(|| ApiError::Shape("missing entities".to_string()))?;
    let mut labels = HashMap::new();
    for (id, entity) in entities {
        let holder = if entity.get("lemmas").is_some() {
            entity.get("lemmas")
        } else {
            entity.get("labels")
        };
        let label = holder
            .and_then(|h| h.get(language))
            .and_then(|l| l.get("value"))
            .and_then(Value::as_str);
        if let Some(label) = label {
            labels.insert(id.clone(), label.to_string());
        }
    }
    Ok(labels)
}

fn parse_associated_page(value: &Value) -> Option<String> {
    value
        .get("query")
        .and_then(|q| q.get("pages"))
        .and_then(Value::as_array)
        .and_then(|pages| pages.first())
        .and_then(|page| page.get("associatedpage"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[async_trait]
impl SiteApi for HttpSiteApi {
    async fn watchlist_slice(
        &self,
        query: &WatchlistQuery,
        continuation: Option<&str>,
    ) -> Result<WatchlistSlice, ApiError> {
        let mut params = vec![
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("list", "watchlist"),
            ("wlallrev", "1"),
            ("wllimit", "max"),
            ("wltype", query.type_filter.as_str()),
            ("wlprop", query.props.as_str()),
        ];
        if !query.show.is_empty() {
            params.push(("wlshow", query.show.as_str()));
        }
        if let Some(token) = continuation {
            params.push(("wlcontinue", token));
        }
        let value = self.request_json(&params, false).await?;
        parse_watchlist_slice(&value)
    }

    async fn tag_display_names(&self) -> Result<HashMap<String, Option<String>>, ApiError> {
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("list", "tags"),
            ("tgprop", "displayname"),
            ("tglimit", "max"),
        ];
        let value = self.request_json(&params, false).await?;
        parse_tag_names(&value)
    }

    async fn entity_labels(
        &self,
        ids: &[String],
        language: &str,
    ) -> Result<HashMap<String, String>, ApiError> {
        let joined = ids.join("|");
        let params = [
            ("action", "wbgetentities"),
            ("format", "json"),
            ("formatversion", "2"),
            ("ids", joined.as_str()),
            ("props", "labels"),
            ("languages", language),
        ];
        let value = self.request_json(&params, false).await?;
        parse_entity_labels(&value, language)
    }

    async fn set_watched(&self, title: &str, watch: bool) -> Result<(), ApiError> {
        let mut params = vec![
            ("action", "watch"),
            ("format", "json"),
            ("formatversion", "2"),
            ("titles", title),
            ("token", ANON_TOKEN),
        ];
        if !watch {
            params.push(("unwatch", "1"));
        }
        self.request_json(&params, true).await?;
        Ok(())
    }

    async fn mark_seen(&self, title: Option<&str>) -> Result<(), ApiError> {
        let mut params = vec![
            ("action", "setnotificationtimestamp"),
            ("format", "json"),
            ("formatversion", "2"),
            ("token", ANON_TOKEN),
        ];
        match title {
            Some(title) => params.push(("titles", title)),
            None => params.push(("entirewatchlist", "1")),
        }
        self.request_json(&params, true).await?;
        Ok(())
    }

    async fn associated_page(&self, title: &str) -> Result<Option<String>, ApiError> {
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("prop", "info"),
            ("inprop", "associatedpage"),
            ("titles", title),
        ];
        let value = self.request_json(&params, false).await?;
        Ok(parse_associated_page(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswatch_core::FilterLevel;
    use serde_json::json;

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn query_covers_all_types_and_props_by_default() {
        let query = WatchlistQuery::from_settings(&Settings::default());
        assert_eq!(query.type_filter, "edit|new|log");
        assert!(query.props.contains("parsedcomment"));
        assert!(query.props.contains("tags"));
        assert!(query.show.is_empty());
    }

    #[test]
    fn fast_mode_reduces_the_property_set() {
        let settings = Settings {
            fast_mode: true,
            ..Settings::default()
        };
        let query = WatchlistQuery::from_settings(&settings);
        assert_eq!(query.props, "ids|title|flags|loginfo|expiry");
    }

    #[test]
    fn show_tokens_combine_tri_state_filters() {
        let settings = Settings {
            anon_filter: FilterLevel::Only,
            bot_filter: FilterLevel::Exclude,
            minor_filter: FilterLevel::Either,
            ..Settings::default()
        };
        let query = WatchlistQuery::from_settings(&settings);
        assert_eq!(query.show, "anon|!bot");
    }

    #[test]
    fn type_filter_follows_show_flags() {
        let settings = Settings {
            show_new_pages: false,
            show_log_entries: false,
            ..Settings::default()
        };
        let query = WatchlistQuery::from_settings(&settings);
        assert_eq!(query.type_filter, "edit");
    }

    #[test]
    fn watchlist_slice_parses_rows_and_continuation() {
        let value = json!({
            "continue": { "wlcontinue": "20210704073049|12345", "continue": "-||" },
            "query": { "watchlist": [
                { "pageid": 1, "ns": 0, "title": "A", "type": "edit",
                  "old_revid": 10, "revid": 11 }
            ]}
        });
        let slice = parse_watchlist_slice(&value).expect("parse");
        assert_eq!(slice.records.len(), 1);
        assert_eq!(slice.continuation.as_deref(), Some("20210704073049|12345"));
    }

    #[test]
    fn final_page_has_no_continuation() {
        let value = json!({ "query": { "watchlist": [] } });
        let slice = parse_watchlist_slice(&value).expect("parse");
        assert!(slice.records.is_empty());
        assert_eq!(slice.continuation, None);
    }

    #[test]
    fn api_error_envelope_surfaces_as_typed_error() {
        let value = json!({ "error": { "code": "wlnotloggedin", "info": "You must be logged in." } });
        let err = check_api_error(&value).expect_err("error envelope");
        match err {
            ApiError::Api { code, info } => {
                assert_eq!(code, "wlnotloggedin");
                assert!(info.contains("logged in"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn tag_names_fall_back_to_none_when_displayname_empty() {
        let value = json!({ "query": { "tags": [
            { "name": "mw-rollback", "displayname": "Rollback" },
            { "name": "mobile edit", "displayname": "" },
            { "name": "undisplayed" }
        ]}});
        let tags = parse_tag_names(&value).expect("parse");
        assert_eq!(tags["mw-rollback"].as_deref(), Some("Rollback"));
        assert_eq!(tags["mobile edit"], None);
        assert_eq!(tags["undisplayed"], None);
    }

    #[test]
    fn entity_labels_prefer_lemmas_for_lexemes() {
        let value = json!({ "entities": {
            "Q42": { "labels": { "en": { "language": "en", "value": "Douglas Adams" } } },
            "L99": { "lemmas": { "en": { "language": "en", "value": "run" } } },
            "Q7": { "labels": {} }
        }});
        let labels = parse_entity_labels(&value, "en").expect("parse");
        assert_eq!(labels["Q42"], "Douglas Adams");
        assert_eq!(labels["L99"], "run");
        assert!(!labels.contains_key("Q7"));
    }

    #[test]
    fn associated_page_extracted_from_info_response() {
        let value = json!({ "query": { "pages": [
            { "pageid": 3, "title": "Example", "associatedpage": "Talk:Example" }
        ]}});
        assert_eq!(
            parse_associated_page(&value).as_deref(),
            Some("Talk:Example")
        );
        assert_eq!(parse_associated_page(&json!({})), None);
    }
}
