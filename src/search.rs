//! Release search aggregation across indexer plugins.
//!
//! One logical search fans out to every indexer-capable plugin concurrently,
//! tolerates partial failure, retries title-based when an external-id search
//! comes back empty, then merges: dedup by guid, domain filters, sort by
//! publish date, truncate.
//!
//! Indexer plugins answer the HTTP-shaped paths `/search`, `/search/tv` and
//! `/search/movie` with a JSON array of [`Release`] objects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::RpcRequest;
use crate::rpc::PluginRpc;
use crate::supervisor::PluginSupervisor;

/// What kind of media a search is for; selects the plugin-side path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    #[default]
    General,
    Tv,
    Movie,
}

/// One logical search request.
///
/// External ids and season/episode follow torznab conventions: an empty
/// string or zero means "not specified".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub query: String,
    #[serde(rename = "type")]
    pub kind: SearchKind,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tv_rage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    pub limit: usize,
    pub offset: usize,
}

impl SearchRequest {
    fn season_set(&self) -> bool {
        matches!(self.season, Some(s) if s > 0)
    }

    fn episode_set(&self) -> bool {
        matches!(self.episode, Some(e) if e > 0)
    }

    fn has_tv_db_id(&self) -> bool {
        id_set(&self.tvdb_id) || id_set(&self.tv_rage_id)
    }

    fn has_external_id(&self) -> bool {
        id_set(&self.tvdb_id)
            || id_set(&self.imdb_id)
            || id_set(&self.tmdb_id)
            || id_set(&self.tv_rage_id)
    }

    /// The retitled fallback variant: external TV ids cleared so indexers
    /// fall back to the human-readable query string.
    fn without_tv_db_id(&self) -> Self {
        let mut retry = self.clone();
        retry.tvdb_id = None;
        retry.tv_rage_id = None;
        retry
    }
}

fn id_set(id: &Option<String>) -> bool {
    matches!(id, Some(v) if !v.is_empty())
}

/// One candidate download returned by an indexer plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Release {
    pub guid: String,
    pub title: String,
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<DateTime<Utc>>,
    pub category: String,
    pub size_bytes: i64,
    pub download_url: String,
    pub description: String,
    pub attributes: HashMap<String, String>,
    pub indexer_id: String,
    pub indexer_name: String,
}

impl Default for Release {
    fn default() -> Self {
        Self {
            guid: String::new(),
            title: String::new(),
            link: String::new(),
            publish_date: None,
            category: String::new(),
            size_bytes: 0,
            download_url: String::new(),
            description: String::new(),
            attributes: HashMap::new(),
            indexer_id: String::new(),
            indexer_name: String::new(),
        }
    }
}

/// Aggregated search outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub releases: Vec<Release>,
    /// Count after filtering, before truncation to `limit`.
    pub total: usize,
    /// Plugin ids that yielded at least one raw release (post-fallback,
    /// counted before filtering).
    pub sources: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("all {attempted} indexer plugins failed")]
    AllIndexersFailed { attempted: usize },
}

/// Default per-indexer call budget.
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fan-out search engine over the supervisor's indexer plugins.
pub struct SearchEngine {
    supervisor: Arc<PluginSupervisor>,
    plugin_timeout: Duration,
}

impl SearchEngine {
    pub fn new(supervisor: Arc<PluginSupervisor>, plugin_timeout: Duration) -> Self {
        Self {
            supervisor,
            plugin_timeout,
        }
    }

    /// Run one aggregated search. `cookie_header` is forwarded verbatim so an
    /// indexer that proxies an authenticated upstream can reuse the session.
    pub async fn search(
        &self,
        request: SearchRequest,
        cookie_header: Option<&str>,
        caller_user_id: Option<i64>,
    ) -> Result<SearchResults, SearchError> {
        let indexers = self.supervisor.indexers().await;
        search_indexers(
            &indexers,
            request,
            cookie_header,
            caller_user_id,
            self.plugin_timeout,
        )
        .await
    }
}

async fn search_indexers(
    indexers: &[(String, Arc<dyn PluginRpc>)],
    request: SearchRequest,
    cookie_header: Option<&str>,
    caller_user_id: Option<i64>,
    plugin_timeout: Duration,
) -> Result<SearchResults, SearchError> {
    if indexers.is_empty() {
        return Ok(SearchResults::default());
    }
    let search_id = Uuid::new_v4();
    debug!(
        search = %search_id,
        indexers = indexers.len(),
        query = %request.query,
        kind = ?request.kind,
        "Fanning out search"
    );

    // First pass: one bounded call per indexer, all awaited together.
    let futures: Vec<_> = indexers
        .iter()
        .map(|(id, rpc)| {
            query_indexer(
                id.clone(),
                Arc::clone(rpc),
                &request,
                cookie_header,
                caller_user_id,
                plugin_timeout,
            )
        })
        .collect();
    let outcomes = futures::future::join_all(futures).await;

    let mut succeeded: Vec<(String, Vec<Release>)> = Vec::new();
    let mut failed = 0usize;
    for (plugin_id, outcome) in outcomes {
        match outcome {
            Ok(releases) => succeeded.push((plugin_id, releases)),
            Err(reason) => {
                warn!(search = %search_id, plugin = %plugin_id, reason = %reason, "Indexer query failed");
                failed += 1;
            }
        }
    }
    if succeeded.is_empty() {
        return Err(SearchError::AllIndexersFailed { attempted: failed });
    }

    // Fallback pass: an id-based TV search that came back empty is retried
    // title-based against the same plugin.
    let wants_fallback = request.kind == SearchKind::Tv
        && request.has_tv_db_id()
        && (request.season_set() || request.episode_set())
        && !request.query.is_empty();
    if wants_fallback {
        let retry_request = request.without_tv_db_id();
        let to_retry: Vec<String> = succeeded
            .iter()
            .filter(|(_, releases)| releases.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        let retries: Vec<_> = indexers
            .iter()
            .filter(|(id, _)| to_retry.contains(id))
            .map(|(id, rpc)| {
                query_indexer(
                    id.clone(),
                    Arc::clone(rpc),
                    &retry_request,
                    cookie_header,
                    caller_user_id,
                    plugin_timeout,
                )
            })
            .collect();
        for (plugin_id, outcome) in futures::future::join_all(retries).await {
            match outcome {
                Ok(releases) if !releases.is_empty() => {
                    debug!(search = %search_id, plugin = %plugin_id, count = releases.len(), "Fallback retry yielded releases");
                    if let Some(slot) = succeeded.iter_mut().find(|(id, _)| *id == plugin_id) {
                        slot.1.extend(releases);
                    }
                }
                Ok(_) => {}
                Err(reason) => {
                    // The plugin already answered once; a failed retry does
                    // not demote the overall call.
                    warn!(search = %search_id, plugin = %plugin_id, reason = %reason, "Fallback retry failed");
                }
            }
        }
    }

    // Sources are recorded as soon as a plugin yields any raw release, even
    // if every one of them is filtered out below.
    let sources: Vec<String> = succeeded
        .iter()
        .filter(|(_, releases)| !releases.is_empty())
        .map(|(id, _)| id.clone())
        .collect();

    let mut seen = HashSet::new();
    let mut merged: Vec<Release> = Vec::new();
    for (_, releases) in succeeded {
        for release in releases {
            if seen.insert(release.guid.clone()) {
                merged.push(release);
            }
        }
    }

    let mut filtered = apply_result_filters(&request, merged);
    filtered.sort_by(|a, b| b.publish_date.cmp(&a.publish_date));
    let total = filtered.len();
    if request.limit > 0 && filtered.len() > request.limit {
        filtered.truncate(request.limit);
    }

    info!(
        search = %search_id,
        releases = filtered.len(),
        total,
        sources = sources.len(),
        failed,
        "Search aggregated"
    );
    Ok(SearchResults {
        releases: filtered,
        total,
        sources,
    })
}

type IndexerOutcome = (String, Result<Vec<Release>, String>);

async fn query_indexer(
    plugin_id: String,
    rpc: Arc<dyn PluginRpc>,
    request: &SearchRequest,
    cookie_header: Option<&str>,
    caller_user_id: Option<i64>,
    plugin_timeout: Duration,
) -> IndexerOutcome {
    let envelope = build_search_envelope(request, cookie_header, caller_user_id);
    let result = match tokio::time::timeout(plugin_timeout, rpc.handle_api(envelope)).await {
        Err(_) => Err(format!("timed out after {plugin_timeout:?}")),
        Ok(Err(e)) => Err(e.to_string()),
        Ok(Ok(response)) if response.status_code != 200 => {
            Err(format!("indexer answered HTTP {}", response.status_code))
        }
        Ok(Ok(response)) => serde_json::from_slice::<Vec<Release>>(&response.body)
            .map_err(|e| format!("malformed release list: {e}")),
    };
    (plugin_id, result)
}

/// Build the HTTP-shaped envelope for one indexer query.
fn build_search_envelope(
    request: &SearchRequest,
    cookie_header: Option<&str>,
    caller_user_id: Option<i64>,
) -> RpcRequest {
    let path = match request.kind {
        SearchKind::General => "/search",
        SearchKind::Tv => "/search/tv",
        SearchKind::Movie => "/search/movie",
    };
    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    let mut param = |key: &str, value: String| {
        query.insert(key.to_string(), vec![value]);
    };
    if !request.query.is_empty() {
        param("q", request.query.clone());
    }
    if let Some(id) = request.tvdb_id.as_ref().filter(|v| !v.is_empty()) {
        param("tvdbid", id.clone());
    }
    if let Some(id) = request.imdb_id.as_ref().filter(|v| !v.is_empty()) {
        param("imdbid", id.clone());
    }
    if let Some(id) = request.tmdb_id.as_ref().filter(|v| !v.is_empty()) {
        param("tmdbid", id.clone());
    }
    if let Some(id) = request.tv_rage_id.as_ref().filter(|v| !v.is_empty()) {
        param("rid", id.clone());
    }
    if request.season_set() {
        param("season", request.season.unwrap_or(0).to_string());
    }
    if request.episode_set() {
        param("ep", request.episode.unwrap_or(0).to_string());
    }
    if !request.categories.is_empty() {
        param("cat", request.categories.join(","));
    }
    if request.limit > 0 {
        param("limit", request.limit.to_string());
    }
    if request.offset > 0 {
        param("offset", request.offset.to_string());
    }

    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(cookie) = cookie_header.filter(|c| !c.is_empty()) {
        headers.insert("Cookie".to_string(), vec![cookie.to_string()]);
    }

    RpcRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        query,
        headers,
        body: Vec::new(),
        caller_user_id,
        scopes: Vec::new(),
    }
}

/// Result-shape filters conditioned on the request.
fn apply_result_filters(request: &SearchRequest, releases: Vec<Release>) -> Vec<Release> {
    let mut out = releases;

    // Title-based TV search: drop releases that merely share a prefix word
    // with the wanted series (spin-offs and similar).
    if request.kind == SearchKind::Tv && !request.query.is_empty() && !request.has_external_id() {
        out.retain(|r| title_matches_series(&request.query, &r.title));
    }

    // Season-pack search: a season without a specific episode must not be
    // polluted by single episodes or multi-season bundles.
    if request.kind == SearchKind::Tv && request.season_set() && !request.episode_set() {
        out.retain(|r| !has_episode_marker(&r.title) && !has_season_range_marker(&r.title));
    }

    out
}

/// Lowercase and collapse `.`/`_`/`-` separators into single spaces.
pub fn normalize_title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.chars() {
        let c = match c {
            '.' | '_' | '-' => ' ',
            other => other,
        };
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Whether a release title names exactly the wanted series.
///
/// The normalized title must start with the normalized query followed by
/// nothing, a year in parentheses, or a season marker. "The Rookie" matches
/// `The.Rookie.S01E01` and `The Rookie (2018) S01E01` but not
/// `The.Rookie.Feds.S01E01`.
pub fn title_matches_series(query: &str, title: &str) -> bool {
    let q = normalize_title(query);
    if q.is_empty() {
        return true;
    }
    let t = normalize_title(title);
    let rest = match t.strip_prefix(&q) {
        Some(rest) => rest,
        None => return false,
    };
    if rest.is_empty() {
        return true;
    }
    if !rest.starts_with(' ') {
        // Prefix ended mid-word ("the rookies ...").
        return false;
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        return true;
    }
    let year = Regex::new(r"^\(\d{4}\)").unwrap();
    let season = Regex::new(r"^(s\d{1,2}|season \d{1,2})").unwrap();
    year.is_match(rest) || season.is_match(rest)
}

/// True when the title carries a single-episode marker like `S01E03`.
pub fn has_episode_marker(title: &str) -> bool {
    Regex::new(r"(?i)s\d{1,2}e\d{1,2}").unwrap().is_match(title)
}

/// True for multi-season range markers like `S01-08` or `S01-S08`.
pub fn has_season_range_marker(title: &str) -> bool {
    Regex::new(r"(?i)s\d{1,2}\s?-\s?s?\d{1,2}")
        .unwrap()
        .is_match(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        EventPayload, PluginMetadata, RouteDescriptor, RpcResponse, UiManifest,
    };
    use crate::rpc::RpcError;
    use crate::transport::TransportError;
    use async_trait::async_trait;

    type ApiScript = Box<dyn Fn(RpcRequest) -> Result<RpcResponse, RpcError> + Send + Sync>;

    struct ScriptedIndexer {
        script: ApiScript,
    }

    #[async_trait]
    impl PluginRpc for ScriptedIndexer {
        async fn metadata(&self) -> Result<PluginMetadata, RpcError> {
            unreachable!("not part of search");
        }
        async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, RpcError> {
            unreachable!("not part of search");
        }
        async fn handle_api(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
            (self.script)(request)
        }
        async fn ui_manifest(&self) -> Result<UiManifest, RpcError> {
            unreachable!("not part of search");
        }
        async fn handle_event(&self, _event: EventPayload) -> Result<(), RpcError> {
            unreachable!("not part of search");
        }
        async fn is_indexer(&self) -> Result<bool, RpcError> {
            Ok(true)
        }
        async fn is_downloader(&self) -> Result<bool, RpcError> {
            Ok(false)
        }
        async fn search(&self, _request: SearchRequest) -> Result<Vec<Release>, RpcError> {
            unreachable!("aggregation goes through handle_api");
        }
    }

    fn indexer(
        id: &str,
        script: impl Fn(RpcRequest) -> Result<RpcResponse, RpcError> + Send + Sync + 'static,
    ) -> (String, Arc<dyn PluginRpc>) {
        (
            id.to_string(),
            Arc::new(ScriptedIndexer {
                script: Box::new(script),
            }),
        )
    }

    fn release(guid: &str, title: &str) -> Release {
        Release {
            guid: guid.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn ok_with(releases: Vec<Release>) -> Result<RpcResponse, RpcError> {
        Ok(RpcResponse::json(200, &releases))
    }

    fn transport_err() -> Result<RpcResponse, RpcError> {
        Err(RpcError::Transport(TransportError::ProcessExited))
    }

    async fn run(
        indexers: Vec<(String, Arc<dyn PluginRpc>)>,
        request: SearchRequest,
    ) -> Result<SearchResults, SearchError> {
        search_indexers(&indexers, request, None, None, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn test_no_indexers_is_empty_success() {
        let results = run(vec![], SearchRequest::default()).await.unwrap();
        assert!(results.releases.is_empty());
        assert!(results.sources.is_empty());
        assert_eq!(results.total, 0);
    }

    #[tokio::test]
    async fn test_dedup_by_guid_keeps_first() {
        let indexers = vec![
            indexer("a", |_| {
                ok_with(vec![release("guid-1", "Show.S02E01"), release("guid-2", "Show.S02E02")])
            }),
            indexer("b", |_| ok_with(vec![release("guid-1", "Show.S02E01.PROPER")])),
        ];
        let results = run(indexers, SearchRequest::default()).await.unwrap();
        assert_eq!(results.releases.len(), 2);
        let kept: Vec<_> = results.releases.iter().map(|r| r.guid.as_str()).collect();
        assert!(kept.contains(&"guid-1") && kept.contains(&"guid-2"));
        let first = results
            .releases
            .iter()
            .find(|r| r.guid == "guid-1")
            .unwrap();
        assert_eq!(first.title, "Show.S02E01", "first occurrence must win");
        assert_eq!(results.sources.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_union_of_successes() {
        let indexers = vec![
            indexer("a", |_| ok_with(vec![release("g1", "One")])),
            indexer("b", |_| transport_err()),
            indexer("c", |_| ok_with(vec![release("g2", "Two")])),
        ];
        let results = run(indexers, SearchRequest::default())
            .await
            .expect("partial failure is not an error");
        assert_eq!(results.releases.len(), 2);
        assert_eq!(results.sources, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_non_200_counts_as_failure() {
        let indexers = vec![
            indexer("a", |_| Ok(RpcResponse::status(500))),
            indexer("b", |_| ok_with(vec![release("g1", "One")])),
        ];
        let results = run(indexers, SearchRequest::default()).await.unwrap();
        assert_eq!(results.releases.len(), 1);
        assert_eq!(results.sources, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_all_indexers_failing_is_an_error() {
        let indexers = vec![
            indexer("a", |_| transport_err()),
            indexer("b", |_| Ok(RpcResponse::status(502))),
        ];
        let err = run(indexers, SearchRequest::default())
            .await
            .expect_err("every indexer failing must surface");
        match err {
            SearchError::AllIndexersFailed { attempted } => assert_eq!(attempted, 2),
        }
    }

    #[tokio::test]
    async fn test_fallback_retry_merges_and_counts_source() {
        // Id-based lookups find nothing; the retitled query does.
        let indexers = vec![indexer("idx", |req| {
            if req.query_first("tvdbid").is_some() {
                ok_with(vec![])
            } else {
                assert_eq!(req.query_first("q"), Some("The Rookie"));
                ok_with(vec![
                    release("f1", "The.Rookie.S01E02.1080p"),
                    release("f2", "The.Rookie.S01E02.720p"),
                ])
            }
        })];
        let request = SearchRequest {
            query: "The Rookie".to_string(),
            kind: SearchKind::Tv,
            tvdb_id: Some("350665".to_string()),
            season: Some(1),
            episode: Some(2),
            ..Default::default()
        };
        let results = run(indexers, request).await.unwrap();
        assert_eq!(results.releases.len(), 2);
        assert_eq!(results.sources, vec!["idx".to_string()]);
    }

    #[tokio::test]
    async fn test_no_fallback_without_tv_kind() {
        let indexers = vec![indexer("idx", |req| {
            assert!(
                req.query_first("tvdbid").is_some(),
                "a general search must not be retried without its ids"
            );
            ok_with(vec![])
        })];
        let request = SearchRequest {
            query: "The Rookie".to_string(),
            kind: SearchKind::General,
            tvdb_id: Some("350665".to_string()),
            season: Some(1),
            episode: Some(2),
            ..Default::default()
        };
        let results = run(indexers, request).await.unwrap();
        assert!(results.releases.is_empty());
        assert!(results.sources.is_empty(), "no raw data means no source");
    }

    #[tokio::test]
    async fn test_season_pack_filter() {
        let indexers = vec![indexer("idx", |_| {
            ok_with(vec![
                release("g1", "Show.Name.S01E03.1080p"),
                release("g2", "Show.Name.S01.COMPLETE.1080p"),
                release("g3", "Show.Name.S01-08.COMPLETE"),
            ])
        })];
        let request = SearchRequest {
            kind: SearchKind::Tv,
            tvdb_id: Some("1".to_string()),
            season: Some(1),
            episode: None,
            ..Default::default()
        };
        let results = run(indexers, request).await.unwrap();
        assert_eq!(results.releases.len(), 1);
        assert_eq!(results.releases[0].title, "Show.Name.S01.COMPLETE.1080p");
    }

    #[tokio::test]
    async fn test_series_name_filter_and_sources_before_filtering() {
        let indexers = vec![
            indexer("good", |_| {
                ok_with(vec![
                    release("g1", "The.Rookie.S01E01"),
                    release("g2", "The Rookie (2018) S01E01"),
                ])
            }),
            indexer("spinoff", |_| {
                ok_with(vec![release("g3", "The.Rookie.Feds.S01E01")])
            }),
        ];
        let request = SearchRequest {
            query: "The Rookie".to_string(),
            kind: SearchKind::Tv,
            ..Default::default()
        };
        let results = run(indexers, request).await.unwrap();
        let titles: Vec<_> = results.releases.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["The.Rookie.S01E01", "The Rookie (2018) S01E01"],
            "spin-off must be filtered out"
        );
        // The spin-off indexer yielded raw data, so it still counts.
        assert_eq!(
            results.sources,
            vec!["good".to_string(), "spinoff".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sort_desc_and_limit() {
        let old = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let newer = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let indexers = vec![indexer("idx", move |_| {
            let mut a = release("g1", "Old");
            a.publish_date = Some(old);
            let mut b = release("g2", "New");
            b.publish_date = Some(newer);
            let c = release("g3", "Undated");
            ok_with(vec![a, b, c])
        })];
        let request = SearchRequest {
            limit: 2,
            ..Default::default()
        };
        let results = run(indexers, request).await.unwrap();
        assert_eq!(results.total, 3, "total counts pre-truncation");
        assert_eq!(results.releases.len(), 2);
        assert_eq!(results.releases[0].title, "New");
        assert_eq!(results.releases[1].title, "Old");
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_failure() {
        let indexers = vec![
            (
                "slow".to_string(),
                Arc::new(SlowIndexer) as Arc<dyn PluginRpc>,
            ),
            indexer("fast", |_| ok_with(vec![release("g1", "One")])),
        ];
        let results = search_indexers(
            &indexers,
            SearchRequest::default(),
            None,
            None,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(results.sources, vec!["fast".to_string()]);
        assert_eq!(results.releases.len(), 1);
    }

    struct SlowIndexer;

    #[async_trait]
    impl PluginRpc for SlowIndexer {
        async fn metadata(&self) -> Result<PluginMetadata, RpcError> {
            unreachable!();
        }
        async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, RpcError> {
            unreachable!();
        }
        async fn handle_api(&self, _request: RpcRequest) -> Result<RpcResponse, RpcError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RpcResponse::status(200))
        }
        async fn ui_manifest(&self) -> Result<UiManifest, RpcError> {
            unreachable!();
        }
        async fn handle_event(&self, _event: EventPayload) -> Result<(), RpcError> {
            unreachable!();
        }
        async fn is_indexer(&self) -> Result<bool, RpcError> {
            Ok(true)
        }
        async fn is_downloader(&self) -> Result<bool, RpcError> {
            Ok(false)
        }
        async fn search(&self, _request: SearchRequest) -> Result<Vec<Release>, RpcError> {
            unreachable!();
        }
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("The.Rookie_S01-E01"), "the rookie s01 e01");
        assert_eq!(normalize_title("  Spaced   Out  "), "spaced out");
    }

    #[test]
    fn test_title_matches_series_cases() {
        assert!(title_matches_series("The Rookie", "The.Rookie.S01E01"));
        assert!(title_matches_series("The Rookie", "The Rookie (2018) S01E01"));
        assert!(title_matches_series("The Rookie", "The Rookie"));
        assert!(title_matches_series("The Rookie", "The Rookie Season 2 Complete"));
        assert!(!title_matches_series("The Rookie", "The.Rookie.Feds.S01E01"));
        assert!(!title_matches_series("The Rookie", "The Rookies S01E01"));
        assert!(!title_matches_series("The Rookie", "Rookie S01E01"));
    }

    #[test]
    fn test_episode_and_range_markers() {
        assert!(has_episode_marker("Show.Name.S01E03.1080p"));
        assert!(has_episode_marker("show s1e3"));
        assert!(!has_episode_marker("Show.Name.S01.COMPLETE.1080p"));
        assert!(has_season_range_marker("Show.S01-08.COMPLETE"));
        assert!(has_season_range_marker("Show S01-S08"));
        assert!(!has_season_range_marker("Show.Name.S01.COMPLETE"));
        assert!(!has_season_range_marker("Show.Name.S01E08"));
    }
}
