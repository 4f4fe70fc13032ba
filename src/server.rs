//! HTTP server: management API, search endpoint, and plugin routes.
//!
//! Fixed routes cover health, the plugin management surface, and search.
//! Everything else falls through to the plugin route table: any path a
//! loaded plugin declared gets bridged to that plugin's process. Static
//! assets under `/plugins/{id}/` are served straight from disk.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::bridge::{self, BridgeError, CallerIdentity};
use crate::config::{AppConfig, AuthConfig};
use crate::manifest::PluginManifest;
use crate::search::{SearchEngine, SearchError, SearchKind, SearchRequest};
use crate::sdk::HostSdk;
use crate::store::Store;
use crate::supervisor::{PluginSupervisor, SupervisorError};

/// Session cookie checked by the built-in token resolver.
pub const SESSION_COOKIE: &str = "medley_session";

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<PluginSupervisor>,
    pub engine: Arc<SearchEngine>,
    pub store: Arc<Store>,
    pub sessions: Arc<dyn SessionResolver>,
}

/// Maps request credentials to a caller identity.
///
/// The surrounding application normally supplies this; the built-in
/// [`TokenResolver`] covers standalone use with static tokens.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<CallerIdentity>;
}

/// Static-token resolver driven by [`AuthConfig`].
pub struct TokenResolver {
    auth: AuthConfig,
}

impl TokenResolver {
    pub fn new(auth: AuthConfig) -> Self {
        Self { auth }
    }

    fn presented_token(headers: &HeaderMap) -> Option<String> {
        let jar = CookieJar::from_headers(headers);
        if let Some(cookie) = jar.get(SESSION_COOKIE) {
            return Some(cookie.value().to_string());
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.to_string())
    }
}

impl SessionResolver for TokenResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<CallerIdentity> {
        let token = Self::presented_token(headers)?;
        if self.auth.admin_token.as_deref() == Some(token.as_str()) {
            return Some(CallerIdentity {
                user_id: 0,
                is_admin: true,
                scopes: Vec::new(),
            });
        }
        if self.auth.session_token.as_deref() == Some(token.as_str()) {
            return Some(CallerIdentity {
                user_id: 1,
                is_admin: false,
                scopes: Vec::new(),
            });
        }
        None
    }
}

/// Errors surfaced by the management API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Admin privileges required")]
    Forbidden,

    #[error("{0}")]
    Supervisor(#[from] SupervisorError),

    #[error("{0}")]
    Search(#[from] SearchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::PluginNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Supervisor(SupervisorError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Supervisor(SupervisorError::Manifest(_)) => StatusCode::NOT_FOUND,
            ApiError::Supervisor(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Search(_) => StatusCode::BAD_GATEWAY,
        };

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "api_error"
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Create the host router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Plugin management
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/{id}", get(get_plugin))
        .route("/api/plugins/{id}/ui-manifest", get(get_ui_manifest))
        .route("/api/plugins/{id}/enable", post(enable_plugin))
        .route("/api/plugins/{id}/disable", post(disable_plugin))
        // Aggregated search across indexer plugins
        .route("/api/search", get(search))
        // Plugin static assets
        .route("/plugins/{id}/{*path}", get(plugin_asset))
        .route("/plugins/{id}", get(plugin_asset_root))
        // Anything else may belong to a plugin-declared route
        .fallback(plugin_route_fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "medley",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn list_plugins(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list().await)
}

async fn get_plugin(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let info = state
        .supervisor
        .list()
        .await
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| ApiError::PluginNotFound(id))?;
    Ok(Json(info).into_response())
}

async fn get_ui_manifest(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let plugin = state
        .supervisor
        .get(&id)
        .await
        .ok_or_else(|| ApiError::PluginNotFound(id))?;
    Ok(Json(plugin.ui_manifest.clone().unwrap_or_default()).into_response())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity, ApiError> {
    let caller = state
        .sessions
        .resolve(headers)
        .ok_or(ApiError::Unauthorized)?;
    if !caller.is_admin {
        return Err(ApiError::Forbidden);
    }
    Ok(caller)
}

async fn enable_plugin(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.enable_plugin(&id).await?;
    info!(plugin = %id, "Plugin enabled");
    Ok(Json(serde_json::json!({"id": id, "enabled": true})).into_response())
}

async fn disable_plugin(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.disable_plugin(&id).await?;
    info!(plugin = %id, "Plugin disabled");
    Ok(Json(serde_json::json!({"id": id, "enabled": false})).into_response())
}

/// Flat query parameters for `/api/search`, torznab-style names.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchParams {
    #[serde(rename = "type")]
    kind: Option<SearchKind>,
    q: Option<String>,
    tvdbid: Option<String>,
    imdbid: Option<String>,
    tmdbid: Option<String>,
    rid: Option<String>,
    season: Option<u32>,
    ep: Option<u32>,
    cat: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl SearchParams {
    fn into_request(self) -> SearchRequest {
        SearchRequest {
            query: self.q.unwrap_or_default(),
            kind: self.kind.unwrap_or_default(),
            categories: self
                .cat
                .map(|c| {
                    c.split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            tvdb_id: self.tvdbid,
            imdb_id: self.imdbid,
            tmdb_id: self.tmdbid,
            tv_rage_id: self.rid,
            season: self.season,
            episode: self.ep,
            limit: self.limit.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
        }
    }
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let caller = state.sessions.resolve(&headers);
    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok());
    let results = state
        .engine
        .search(
            params.into_request(),
            cookie_header,
            caller.map(|c| c.user_id),
        )
        .await?;
    Ok(Json(results).into_response())
}

fn valid_plugin_id(id: &str) -> bool {
    !id.is_empty()
        && !id
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == '.')
}

async fn plugin_asset(
    State(state): State<AppState>,
    AxumPath((id, path)): AxumPath<(String, String)>,
) -> Result<Response, BridgeError> {
    serve_asset(&state, &id, &path).await
}

async fn plugin_asset_root(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, BridgeError> {
    serve_asset(&state, &id, "").await
}

async fn serve_asset(state: &AppState, id: &str, path: &str) -> Result<Response, BridgeError> {
    // The id comes straight off the URL; never let it name a directory
    // outside the plugins root.
    if !valid_plugin_id(id) {
        return Err(BridgeError::NotFound);
    }
    let plugin_dir = state.supervisor.plugins_dir().join(id);
    let asset_dir = match state.supervisor.get(id).await {
        Some(plugin) => plugin.manifest.static_asset_dir.clone(),
        // Assets are plain files; a stopped plugin's UI still serves.
        None => PluginManifest::load(&plugin_dir)
            .map_err(|_| BridgeError::NotFound)?
            .static_asset_dir,
    };
    bridge::serve_static_asset(&plugin_dir, &asset_dir, path).await
}

/// Match one request against every route a loaded plugin declared.
///
/// Patterns use the same segment syntax plugins declare: literal segments,
/// `{param}` for one segment, `{*rest}` for the tail.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let mut pattern_parts = pattern.trim_start_matches('/').split('/');
    let mut path_parts = path.trim_start_matches('/').split('/');

    loop {
        match (pattern_parts.next(), path_parts.next()) {
            (None, None) => return true,
            (Some(p), _) if p.starts_with("{*") && p.ends_with('}') => return true,
            (Some(p), Some(s)) => {
                let wildcard = p.starts_with('{') && p.ends_with('}');
                if !wildcard && p != s {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

async fn plugin_route_fallback(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    for plugin in state.supervisor.loaded().await {
        for route in &plugin.routes {
            if !route.method.eq_ignore_ascii_case(method.as_str()) {
                continue;
            }
            if !path_matches(&route.path, path) {
                continue;
            }

            let caller = state.sessions.resolve(&headers);
            let request = bridge::build_rpc_request(
                &method,
                path,
                uri.query(),
                &headers,
                body.to_vec(),
                caller.as_ref(),
            );
            return match bridge::handle_plugin_api(&plugin, route, request, caller.as_ref())
                .await
            {
                Ok(response) => response,
                Err(e) => e.into_response(),
            };
        }
    }

    let body = serde_json::json!({
        "error": {
            "message": "Not found",
            "type": "api_error"
        }
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

/// Assemble state, bind, and serve until `shutdown` resolves. Plugins are
/// stopped after the listener closes.
pub async fn start_server(
    config: AppConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.database.path)?);
    let sdk = Arc::new(HostSdk::new(store.clone()));
    let supervisor = Arc::new(PluginSupervisor::new(
        config.plugins.dir.clone(),
        store.clone(),
        sdk,
        config.plugins.load_timeout(),
    ));

    if config.plugins.enabled {
        supervisor.initialize().await;
    } else {
        info!("Plugin subsystem disabled by configuration");
    }

    let engine = Arc::new(SearchEngine::new(
        supervisor.clone(),
        config.search.plugin_timeout(),
    ));
    let state = AppState {
        supervisor: supervisor.clone(),
        engine,
        store,
        sessions: Arc::new(TokenResolver::new(config.auth.clone())),
    };
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;
    info!(address = %addr, "Starting medley server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped, shutting down plugins");
    supervisor.shutdown().await;
    Ok(())
}

/// Serve until Ctrl-C.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    start_server(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await
}
