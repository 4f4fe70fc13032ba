//! Wire contract between the host and plugin processes.
//!
//! Everything that crosses the process boundary lives here: the handshake
//! frames, the host-driven operation set, the reverse (plugin-driven) SDK
//! calls, and the transport-agnostic HTTP envelope used by the route bridge.
//! Frames are JSON documents; byte bodies are base64 on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::search::{Release, SearchRequest};

/// Protocol version for compatibility checking during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the per-spawn handshake token.
///
/// The host generates a fresh token for every spawn and exports it under this
/// name; the plugin must echo it in its `Hello` frame before anything else is
/// accepted. An arbitrary executable that happens to write to stdout will not
/// know the token and is rejected.
pub const HANDSHAKE_TOKEN_ENV: &str = "MEDLEY_PLUGIN_TOKEN";

/// One frame on the plugin connection.
///
/// The plugin opens with `Hello`; the host answers `HelloAck`. After that the
/// host drives `Request`/`Response` pairs, and the plugin may interleave
/// `SdkRequest`/`SdkResponse` pairs while it is servicing a `HandleApi` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Hello(Hello),
    HelloAck(HelloAck),
    Request { id: u64, call: HostCall },
    Response { id: u64, reply: PluginReply },
    SdkRequest { id: u64, call: SdkCall },
    SdkResponse { id: u64, reply: SdkReply },
}

/// First frame a plugin writes after starting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Echo of [`HANDSHAKE_TOKEN_ENV`].
    pub token: String,
    /// Protocol version the plugin speaks.
    pub protocol: u32,
    /// Plugin id, matching its manifest.
    pub plugin_id: String,
}

/// Host acknowledgement completing the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAck {
    pub protocol: u32,
}

/// Operations the host may invoke on a plugin.
///
/// `Metadata` is the only mandatory one; everything else may be answered with
/// an `Error` reply of kind `not_supported`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "camelCase")]
pub enum HostCall {
    /// Identify the plugin. Mandatory; failure aborts the load.
    Metadata,
    /// HTTP routes the plugin wants mounted.
    ApiRoutes,
    /// Forward one HTTP-shaped request to the plugin.
    HandleApi(RpcRequest),
    /// Navigation/UI contribution for the web frontend.
    UiManifest,
    /// Deliver a host event. Best-effort; the reply is only an ack.
    HandleEvent(EventPayload),
    /// Capability probe: can this plugin answer `Search`?
    IsIndexer,
    /// Capability probe: can this plugin take downloads?
    IsDownloader,
    /// Typed release search (indexer plugins only).
    Search(SearchRequest),
}

/// Reply to a [`HostCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "camelCase")]
pub enum PluginReply {
    Metadata(PluginMetadata),
    ApiRoutes(Vec<RouteDescriptor>),
    HandleApi(RpcResponse),
    UiManifest(UiManifest),
    EventAck,
    IsIndexer(bool),
    IsDownloader(bool),
    Search(Vec<Release>),
    Error(ReplyError),
}

/// Error reply from a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ReplyErrorKind,
    pub message: String,
}

/// Categories of plugin-reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyErrorKind {
    /// The plugin does not implement this operation.
    NotSupported,
    /// The request addressed something the plugin does not have.
    NotFound,
    /// The request was malformed from the plugin's point of view.
    BadRequest,
    /// Internal plugin failure.
    Internal,
}

impl ReplyError {
    pub fn not_supported(op: &str) -> Self {
        Self {
            kind: ReplyErrorKind::NotSupported,
            message: format!("operation not supported: {op}"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ReplyErrorKind::Internal,
            message: message.into(),
        }
    }
}

/// Calls a plugin may make back into the host while one of its `HandleApi`
/// invocations is in flight. Config values are namespaced per plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "camelCase")]
pub enum SdkCall {
    ConfigGet { key: String },
    ConfigGetString { key: String },
    ConfigSet { key: String, value: serde_json::Value },
    ConfigDelete { key: String },
}

/// Host reply to an [`SdkCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "camelCase")]
pub enum SdkReply {
    /// Stored JSON value, `None` when the key is absent.
    Value(Option<serde_json::Value>),
    /// String form of the stored value, `None` when absent or not a string.
    Text(Option<String>),
    /// Write or delete acknowledged.
    Done,
    /// Call rejected (unknown key shape, storage failure, or no call in
    /// flight that would grant SDK access).
    Error(String),
}

/// Plugin self-description, fetched once at load time.
///
/// Authoritative over the manifest: the manifest's capability list is only a
/// hint used before the process exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// One HTTP route a plugin asks the host to mount. The host never invents
/// routes; it mounts exactly what the plugin declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    /// HTTP method, uppercase ("GET", "POST", ...).
    pub method: String,
    /// Path as declared, e.g. `/search/tv` or `/items/{id}`.
    pub path: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Free-form grouping label for docs/UI.
    #[serde(default)]
    pub tag: String,
}

/// Per-route authentication policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication; the request passes straight through.
    #[default]
    None,
    /// A validated caller identity must be attached, else 401.
    Session,
    /// Reserved. Declared routes round-trip, but enforcement currently
    /// behaves like `None` and the bridge logs a warning per request.
    ApiKey,
}

/// UI contribution a plugin exposes to the web frontend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiManifest {
    #[serde(default)]
    pub nav_items: Vec<NavItem>,
    #[serde(default)]
    pub routes: Vec<UiRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<UiConfigSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavItem {
    pub label: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiRoute {
    pub path: String,
    pub component: String,
}

/// Optional settings section rendered on the plugin's settings page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfigSection {
    pub title: String,
    #[serde(default)]
    pub fields: Vec<UiConfigField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfigField {
    pub key: String,
    pub label: String,
    /// Input kind hint: "text", "number", "password", "toggle".
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
}

/// Host event delivered to plugins via `HandleEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Dotted topic, e.g. `host.shutdown` or `library.item.added`.
    pub topic: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Transport-agnostic HTTP request envelope forwarded to a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Response envelope a plugin returns for a `HandleApi` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl RpcRequest {
    /// First value of a query parameter, if present.
    pub fn query_first(&self, key: &str) -> Option<&str> {
        self.query.get(key)?.first().map(String::as_str)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header_first(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

impl RpcResponse {
    /// A JSON response with the given status.
    pub fn json(status_code: u16, value: &impl Serialize) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self {
            status_code,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                vec!["application/json".to_string()],
            )]),
            body,
        }
    }

    /// An empty response with the given status.
    pub fn status(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = Frame::Request {
            id: 7,
            call: HostCall::Metadata,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"request\""), "got: {json}");
        assert!(json.contains("\"id\":7"), "got: {json}");
        assert!(json.contains("\"op\":\"metadata\""), "got: {json}");
    }

    #[test]
    fn test_hello_round_trip() {
        let frame = Frame::Hello(Hello {
            token: "abc123".to_string(),
            protocol: PROTOCOL_VERSION,
            plugin_id: "demo".to_string(),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"pluginId\":\"demo\""), "got: {json}");
        match serde_json::from_str(&json).unwrap() {
            Frame::Hello(hello) => {
                assert_eq!(hello.token, "abc123");
                assert_eq!(hello.protocol, PROTOCOL_VERSION);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_with_list_payload_round_trips() {
        // Adjacent tagging must carry sequence payloads intact.
        let reply = PluginReply::ApiRoutes(vec![RouteDescriptor {
            method: "GET".to_string(),
            path: "/search".to_string(),
            auth_mode: AuthMode::Session,
            tag: "search".to_string(),
        }]);
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"authMode\":\"session\""), "got: {json}");
        match serde_json::from_str(&json).unwrap() {
            PluginReply::ApiRoutes(routes) => {
                assert_eq!(routes.len(), 1);
                assert_eq!(routes[0].path, "/search");
            }
            other => panic!("expected ApiRoutes, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_mode_wire_names() {
        assert_eq!(serde_json::to_string(&AuthMode::None).unwrap(), "\"none\"");
        assert_eq!(
            serde_json::to_string(&AuthMode::Session).unwrap(),
            "\"session\""
        );
        assert_eq!(
            serde_json::to_string(&AuthMode::ApiKey).unwrap(),
            "\"apikey\""
        );
        let parsed: AuthMode = serde_json::from_str("\"apikey\"").unwrap();
        assert_eq!(parsed, AuthMode::ApiKey);
    }

    #[test]
    fn test_route_descriptor_defaults_auth_to_none() {
        let route: RouteDescriptor =
            serde_json::from_str(r#"{"method":"GET","path":"/ping"}"#).unwrap();
        assert_eq!(route.auth_mode, AuthMode::None);
        assert!(route.tag.is_empty());
    }

    #[test]
    fn test_envelope_body_is_base64_on_the_wire() {
        let req = RpcRequest {
            method: "POST".to_string(),
            path: "/items".to_string(),
            body: b"\x00\x01binary".to_vec(),
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("binary"), "raw bytes leaked into JSON: {json}");
        let back: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, b"\x00\x01binary");
    }

    #[test]
    fn test_envelope_empty_body_omitted() {
        let resp = RpcResponse::status(204);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"body\""), "got: {json}");
        let back: RpcResponse = serde_json::from_str(&json).unwrap();
        assert!(back.body.is_empty());
        assert_eq!(back.status_code, 204);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut req = RpcRequest::default();
        req.headers
            .insert("Cookie".to_string(), vec!["session=abc".to_string()]);
        assert_eq!(req.header_first("cookie"), Some("session=abc"));
        assert_eq!(req.header_first("COOKIE"), Some("session=abc"));
        assert_eq!(req.header_first("x-missing"), None);
    }

    #[test]
    fn test_sdk_call_wire_shape() {
        let call = SdkCall::ConfigSet {
            key: "api_url".to_string(),
            value: serde_json::json!("https://indexer.example"),
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"op\":\"configSet\""), "got: {json}");
        let back: SdkCall = serde_json::from_str(&json).unwrap();
        match back {
            SdkCall::ConfigSet { key, .. } => assert_eq!(key, "api_url"),
            other => panic!("expected ConfigSet, got {other:?}"),
        }
    }
}
