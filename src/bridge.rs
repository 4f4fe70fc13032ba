//! Route bridge: HTTP requests in, plugin RPC calls out.
//!
//! Converts an inbound HTTP request into the RPC request shape, applies the
//! route's auth policy, forwards it to the owning plugin, and converts the
//! reply back to HTTP. Static-asset serving for plugin web directories lives
//! here too, behind a path-traversal guard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::protocol::{AuthMode, RouteDescriptor, RpcRequest, RpcResponse};
use crate::rpc::RpcError;
use crate::supervisor::LoadedPlugin;

/// Identity attached to a request by the session layer.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: i64,
    pub is_admin: bool,
    pub scopes: Vec<String>,
}

/// Errors surfaced to HTTP callers by the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    /// Wrapped detail is logged, never shown to the caller.
    #[error("Plugin call failed")]
    PluginCall(#[source] RpcError),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::Unauthorized => StatusCode::UNAUTHORIZED,
            BridgeError::NotFound => StatusCode::NOT_FOUND,
            BridgeError::PluginCall(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "plugin_error"
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Apply a route's declared auth policy before the plugin sees anything.
pub fn enforce_auth(
    plugin_id: &str,
    route: &RouteDescriptor,
    caller: Option<&CallerIdentity>,
) -> Result<(), BridgeError> {
    match route.auth_mode {
        AuthMode::None => Ok(()),
        AuthMode::Session => {
            if caller.is_some() {
                Ok(())
            } else {
                Err(BridgeError::Unauthorized)
            }
        }
        AuthMode::ApiKey => {
            // Declared in the contract but not implemented yet; behaves as
            // `none` so plugins that declare it keep working.
            warn!(
                plugin = %plugin_id,
                path = %route.path,
                "Route declares apikey auth, which is unimplemented; treating as none"
            );
            Ok(())
        }
    }
}

/// Build the RPC envelope for one HTTP request.
pub fn build_rpc_request(
    method: &Method,
    path: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    body: Vec<u8>,
    caller: Option<&CallerIdentity>,
) -> RpcRequest {
    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(raw) = raw_query {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            query.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    let mut header_map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    RpcRequest {
        method: method.as_str().to_string(),
        path: path.to_string(),
        query,
        headers: header_map,
        body,
        caller_user_id: caller.map(|c| c.user_id),
        scopes: caller.map(|c| c.scopes.clone()).unwrap_or_default(),
    }
}

/// Forward one request to a plugin and translate the reply.
///
/// Transport failures (process gone, broken pipe) become a generic 500; the
/// request-handling task never unwinds because a plugin died mid-call.
pub async fn handle_plugin_api(
    plugin: &LoadedPlugin,
    route: &RouteDescriptor,
    request: RpcRequest,
    caller: Option<&CallerIdentity>,
) -> Result<Response, BridgeError> {
    enforce_auth(plugin.id(), route, caller)?;

    match plugin.rpc().handle_api(request).await {
        Ok(reply) => Ok(rpc_to_http(plugin.id(), reply)),
        Err(e) => {
            error!(plugin = %plugin.id(), path = %route.path, error = %e, "Plugin API call failed");
            Err(BridgeError::PluginCall(e))
        }
    }
}

/// Copy an RPC response back out as HTTP: status and headers verbatim, body
/// as-is.
fn rpc_to_http(plugin_id: &str, reply: RpcResponse) -> Response {
    let status =
        StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, values) in &reply.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                warn!(plugin = %plugin_id, header = %name, "Dropping invalid response header name");
                continue;
            };
            for value in values {
                match HeaderValue::try_from(value.as_str()) {
                    Ok(value) => {
                        headers.append(name.clone(), value);
                    }
                    Err(_) => {
                        warn!(plugin = %plugin_id, header = %name, "Dropping invalid response header value");
                    }
                }
            }
        }
    }

    match response.body(Body::from(reply.body)) {
        Ok(response) => response,
        Err(e) => {
            error!(plugin = %plugin_id, error = %e, "Failed to rebuild plugin response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Resolve a static-asset request against a plugin's web directory.
///
/// The resolved path must stay inside the asset directory after following
/// symlinks. Absolute paths, `..` escapes, and anything missing all come
/// back as `NotFound`; the caller learns nothing about the filesystem.
pub fn resolve_static_asset(
    plugin_dir: &Path,
    asset_dir: &str,
    relative: &str,
) -> Result<PathBuf, BridgeError> {
    let relative = if relative.is_empty() || relative == "/" {
        "index.html"
    } else {
        relative
    };
    if Path::new(relative).is_absolute() {
        return Err(BridgeError::NotFound);
    }

    let base = plugin_dir
        .join(asset_dir)
        .canonicalize()
        .map_err(|_| BridgeError::NotFound)?;
    let resolved = base
        .join(relative)
        .canonicalize()
        .map_err(|_| BridgeError::NotFound)?;
    if !resolved.starts_with(&base) || !resolved.is_file() {
        return Err(BridgeError::NotFound);
    }
    Ok(resolved)
}

/// Serve one resolved asset file.
pub async fn serve_static_asset(
    plugin_dir: &Path,
    asset_dir: &str,
    relative: &str,
) -> Result<Response, BridgeError> {
    let path = resolve_static_asset(plugin_dir, asset_dir, relative)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| BridgeError::NotFound)?;

    let mut response = Response::new(Body::from(bytes));
    if let Ok(value) = HeaderValue::try_from(content_type_for(&path)) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn route(auth_mode: AuthMode) -> RouteDescriptor {
        RouteDescriptor {
            method: "GET".to_string(),
            path: "/api/demo/search".to_string(),
            auth_mode,
            tag: String::new(),
        }
    }

    fn caller() -> CallerIdentity {
        CallerIdentity {
            user_id: 7,
            is_admin: false,
            scopes: vec!["search".to_string()],
        }
    }

    #[test]
    fn test_auth_none_passes_anonymous() {
        assert!(enforce_auth("demo", &route(AuthMode::None), None).is_ok());
    }

    #[test]
    fn test_auth_session_requires_identity() {
        let err = enforce_auth("demo", &route(AuthMode::Session), None).unwrap_err();
        assert!(matches!(err, BridgeError::Unauthorized));
        assert!(enforce_auth("demo", &route(AuthMode::Session), Some(&caller())).is_ok());
    }

    #[test]
    fn test_auth_apikey_is_stubbed_open() {
        assert!(enforce_auth("demo", &route(AuthMode::ApiKey), None).is_ok());
    }

    #[test]
    fn test_build_rpc_request_splits_query_and_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        headers.append("x-tag", HeaderValue::from_static("one"));
        headers.append("x-tag", HeaderValue::from_static("two"));

        let request = build_rpc_request(
            &Method::GET,
            "/api/demo/search",
            Some("q=the%20rookie&cat=5000&cat=5070"),
            &headers,
            Vec::new(),
            Some(&caller()),
        );

        assert_eq!(request.method, "GET");
        assert_eq!(request.query.get("q").unwrap(), &vec!["the rookie".to_string()]);
        assert_eq!(
            request.query.get("cat").unwrap(),
            &vec!["5000".to_string(), "5070".to_string()]
        );
        assert_eq!(request.headers.get("x-tag").unwrap().len(), 2);
        assert_eq!(request.caller_user_id, Some(7));
        assert_eq!(request.scopes, vec!["search".to_string()]);
    }

    #[test]
    fn test_build_rpc_request_anonymous_has_no_identity() {
        let request = build_rpc_request(
            &Method::POST,
            "/api/demo/grab",
            None,
            &HeaderMap::new(),
            b"{}".to_vec(),
            None,
        );
        assert_eq!(request.caller_user_id, None);
        assert!(request.scopes.is_empty());
        assert_eq!(request.body, b"{}");
    }

    #[test]
    fn test_rpc_to_http_copies_everything() {
        let mut headers = HashMap::new();
        headers.insert(
            "x-indexer".to_string(),
            vec!["demo".to_string(), "extra".to_string()],
        );
        let reply = RpcResponse {
            status_code: 418,
            headers,
            body: b"short and stout".to_vec(),
        };
        let response = rpc_to_http("demo", reply);
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let values: Vec<_> = response.headers().get_all("x-indexer").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_rpc_to_http_drops_bad_headers() {
        let mut headers = HashMap::new();
        headers.insert("bad name".to_string(), vec!["x".to_string()]);
        headers.insert("x-good".to_string(), vec!["ok".to_string()]);
        let reply = RpcResponse {
            status_code: 200,
            headers,
            body: Vec::new(),
        };
        let response = rpc_to_http("demo", reply);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-good").is_some());
    }

    // ---- static asset guard ----

    fn asset_fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let web = tmp.path().join("web");
        fs::create_dir_all(web.join("css")).unwrap();
        fs::write(web.join("index.html"), "<html></html>").unwrap();
        fs::write(web.join("css/app.css"), "body{}").unwrap();
        fs::write(tmp.path().join("secret.txt"), "keep out").unwrap();
        tmp
    }

    #[test]
    fn test_asset_resolves_nested_file() {
        let tmp = asset_fixture();
        let path = resolve_static_asset(tmp.path(), "web", "css/app.css").unwrap();
        assert!(path.ends_with("css/app.css"));
    }

    #[test]
    fn test_asset_empty_path_serves_index() {
        let tmp = asset_fixture();
        let path = resolve_static_asset(tmp.path(), "web", "").unwrap();
        assert!(path.ends_with("index.html"));
    }

    #[test]
    fn test_asset_rejects_parent_escape() {
        let tmp = asset_fixture();
        let err = resolve_static_asset(tmp.path(), "web", "../secret.txt").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound));
        let err = resolve_static_asset(tmp.path(), "web", "../../etc/passwd").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound));
    }

    #[test]
    fn test_asset_rejects_absolute_path() {
        let tmp = asset_fixture();
        let err = resolve_static_asset(tmp.path(), "web", "/etc/passwd").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound));
    }

    #[test]
    fn test_asset_rejects_symlink_escape() {
        let tmp = asset_fixture();
        std::os::unix::fs::symlink(
            tmp.path().join("secret.txt"),
            tmp.path().join("web/leak.txt"),
        )
        .unwrap();
        let err = resolve_static_asset(tmp.path(), "web", "leak.txt").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound));
    }

    #[test]
    fn test_asset_missing_file_is_not_found() {
        let tmp = asset_fixture();
        let err = resolve_static_asset(tmp.path(), "web", "nope.js").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            content_type_for(Path::new("a/index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(content_type_for(Path::new("a/app.wasm")), "application/octet-stream");
    }
}
