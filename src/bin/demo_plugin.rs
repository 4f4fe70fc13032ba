//! Bundled demo indexer plugin.
//!
//! Speaks the plugin protocol over stdio and answers searches from a
//! `releases.json` file in its plugin directory. Doubles as the reference
//! implementation for plugin authors and as the fixture binary for the
//! integration tests; the `--mode` flag selects deliberate misbehavior for
//! exercising the host's handshake failure paths.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, Stdin, Stdout};

use medley::manifest::PluginManifest;
use medley::protocol::{
    Frame, Hello, HostCall, PluginMetadata, PluginReply, RouteDescriptor, RpcRequest,
    RpcResponse, SdkCall, SdkReply, UiConfigField, UiConfigSection, UiManifest, NavItem,
    HANDSHAKE_TOKEN_ENV, PROTOCOL_VERSION,
};
use medley::search::{Release, SearchRequest};
use medley::transport::{read_frame, write_frame};

#[derive(Parser)]
#[command(name = "medley-demo-plugin", about = "Demo indexer plugin for medley")]
struct Args {
    /// serve (default), or a deliberate failure: silent, bad-token,
    /// wrong-version, garbage, exit
    #[arg(long, default_value = "serve")]
    mode: String,
}

/// Canned search answers, keyed the two ways the host asks.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReleaseBook {
    by_query: HashMap<String, Vec<Release>>,
    by_tvdb_id: HashMap<String, Vec<Release>>,
}

impl ReleaseBook {
    fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    fn lookup(&self, query: Option<&str>, tvdb_id: Option<&str>) -> Vec<Release> {
        if let Some(id) = tvdb_id.filter(|v| !v.is_empty()) {
            return self.by_tvdb_id.get(id).cloned().unwrap_or_default();
        }
        if let Some(q) = query.filter(|v| !v.is_empty()) {
            return self.by_query.get(&q.to_lowercase()).cloned().unwrap_or_default();
        }
        Vec::new()
    }
}

struct DemoPlugin {
    id: String,
    book: ReleaseBook,
    /// Requests that arrived while waiting on an SDK reply.
    backlog: VecDeque<(u64, HostCall)>,
    next_sdk_id: u64,
}

type Reader = BufReader<Stdin>;
type Writer = BufWriter<Stdout>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.mode.as_str() {
        "exit" => return Ok(()),
        "silent" => {
            // Never say hello; the host's handshake timeout has to fire.
            std::future::pending::<()>().await;
            return Ok(());
        }
        "garbage" => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(b"HTTP/1.1 200 OK\r\n\r\nnot a frame").await?;
            stdout.flush().await?;
            std::future::pending::<()>().await;
            return Ok(());
        }
        _ => {}
    }

    let cwd = std::env::current_dir().context("cannot read working directory")?;
    let manifest = PluginManifest::load(&cwd).context("plugin manifest missing")?;
    let token = std::env::var(HANDSHAKE_TOKEN_ENV).unwrap_or_default();

    // Lets tests observe which process answered and when it was restarted.
    std::fs::write("plugin.pid", std::process::id().to_string()).ok();

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = BufWriter::new(tokio::io::stdout());

    let hello = Hello {
        token: match args.mode.as_str() {
            "bad-token" => "not-the-token".to_string(),
            _ => token,
        },
        protocol: match args.mode.as_str() {
            "wrong-version" => PROTOCOL_VERSION + 1,
            _ => PROTOCOL_VERSION,
        },
        plugin_id: manifest.id.clone(),
    };
    write_frame(&mut writer, &Frame::Hello(hello)).await?;

    // A host that rejects the hello just drops the pipe.
    if read_frame(&mut reader).await.is_err() {
        return Ok(());
    }

    let mut plugin = DemoPlugin {
        id: manifest.id,
        book: ReleaseBook::load(&cwd.join("releases.json")),
        backlog: VecDeque::new(),
        next_sdk_id: 1,
    };
    plugin.serve(&mut reader, &mut writer).await
}

impl DemoPlugin {
    async fn serve(&mut self, reader: &mut Reader, writer: &mut Writer) -> Result<()> {
        loop {
            let (id, call) = match self.backlog.pop_front() {
                Some(queued) => queued,
                None => match read_frame(reader).await {
                    Ok(Frame::Request { id, call }) => (id, call),
                    Ok(_) => continue,
                    // Host closed the pipe; normal shutdown.
                    Err(_) => return Ok(()),
                },
            };
            let reply = self.dispatch(call, reader, writer).await?;
            write_frame(writer, &Frame::Response { id, reply }).await?;
        }
    }

    async fn dispatch(
        &mut self,
        call: HostCall,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<PluginReply> {
        Ok(match call {
            HostCall::Metadata => PluginReply::Metadata(self.metadata()),
            HostCall::ApiRoutes => PluginReply::ApiRoutes(self.routes()),
            HostCall::HandleApi(request) => {
                let response = self.handle_api(request, reader, writer).await?;
                PluginReply::HandleApi(response)
            }
            HostCall::UiManifest => PluginReply::UiManifest(self.ui_manifest()),
            HostCall::HandleEvent(event) => {
                if event.topic == "host.shutdown" {
                    std::fs::write("shutdown.marker", &event.topic).ok();
                }
                PluginReply::EventAck
            }
            HostCall::IsIndexer => PluginReply::IsIndexer(true),
            HostCall::IsDownloader => PluginReply::IsDownloader(false),
            HostCall::Search(request) => PluginReply::Search(self.search(&request)),
        })
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            id: self.id.clone(),
            name: format!("Demo Indexer ({})", self.id),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Serves canned releases for demos and tests".to_string(),
            capabilities: vec!["indexer".to_string(), "ui".to_string()],
        }
    }

    fn routes(&self) -> Vec<RouteDescriptor> {
        vec![
            RouteDescriptor {
                method: "GET".to_string(),
                path: format!("/api/{}/search", self.id),
                auth_mode: Default::default(),
                tag: "search".to_string(),
            },
            RouteDescriptor {
                method: "GET".to_string(),
                path: format!("/api/{}/config", self.id),
                auth_mode: Default::default(),
                tag: "config".to_string(),
            },
            RouteDescriptor {
                method: "GET".to_string(),
                path: format!("/api/{}/whoami", self.id),
                auth_mode: medley::protocol::AuthMode::Session,
                tag: "identity".to_string(),
            },
        ]
    }

    fn ui_manifest(&self) -> UiManifest {
        UiManifest {
            nav_items: vec![NavItem {
                label: format!("Demo ({})", self.id),
                path: format!("/plugins/{}", self.id),
                icon: Some("search".to_string()),
            }],
            routes: Vec::new(),
            config: Some(UiConfigSection {
                title: "Demo Indexer".to_string(),
                fields: vec![UiConfigField {
                    key: "greeting".to_string(),
                    label: "Greeting".to_string(),
                    kind: "text".to_string(),
                    required: false,
                }],
            }),
        }
    }

    fn search(&self, request: &SearchRequest) -> Vec<Release> {
        let releases = self
            .book
            .lookup(Some(request.query.as_str()), request.tvdb_id.as_deref());
        self.stamp(releases)
    }

    /// Claim each release for this indexer so aggregation sees real origins.
    fn stamp(&self, mut releases: Vec<Release>) -> Vec<Release> {
        for release in &mut releases {
            release.indexer_id = self.id.clone();
            if release.indexer_name.is_empty() {
                release.indexer_name = format!("Demo Indexer ({})", self.id);
            }
        }
        releases
    }

    async fn handle_api(
        &mut self,
        request: RpcRequest,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<RpcResponse> {
        let path = request.path.clone();
        if path == format!("/api/{}/search", self.id)
            || path == "/search"
            || path.starts_with("/search/")
        {
            let releases = self.book.lookup(
                request.query_first("q"),
                request
                    .query_first("tvdbid")
                    .or_else(|| request.query_first("rid")),
            );
            return Ok(RpcResponse::json(200, &self.stamp(releases)));
        }

        if path == format!("/api/{}/config", self.id) {
            return self.handle_config(&request, reader, writer).await;
        }

        if path == format!("/api/{}/whoami", self.id) {
            return Ok(RpcResponse::json(
                200,
                &serde_json::json!({
                    "callerUserId": request.caller_user_id,
                    "scopes": request.scopes,
                    "cookie": request.header_first("cookie"),
                }),
            ));
        }

        Ok(RpcResponse::status(404))
    }

    /// Round-trips a value through the host SDK: optional write, then read.
    async fn handle_config(
        &mut self,
        request: &RpcRequest,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<RpcResponse> {
        let Some(key) = request.query_first("key").map(|k| k.to_string()) else {
            return Ok(RpcResponse::json(
                400,
                &serde_json::json!({"error": "key parameter required"}),
            ));
        };

        if let Some(value) = request.query_first("value") {
            let value = serde_json::Value::String(value.to_string());
            let reply = self
                .sdk_call(SdkCall::ConfigSet { key: key.clone(), value }, reader, writer)
                .await?;
            if let SdkReply::Error(message) = reply {
                return Ok(RpcResponse::json(502, &serde_json::json!({"error": message})));
            }
        }

        let reply = self
            .sdk_call(SdkCall::ConfigGetString { key: key.clone() }, reader, writer)
            .await?;
        match reply {
            SdkReply::Text(value) => Ok(RpcResponse::json(
                200,
                &serde_json::json!({"key": key, "value": value}),
            )),
            SdkReply::Error(message) => {
                Ok(RpcResponse::json(502, &serde_json::json!({"error": message})))
            }
            _ => Ok(RpcResponse::json(
                502,
                &serde_json::json!({"error": "unexpected SDK reply"}),
            )),
        }
    }

    /// Issue one SDK call and wait for its reply, parking any host requests
    /// that arrive in the meantime.
    async fn sdk_call(
        &mut self,
        call: SdkCall,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<SdkReply> {
        let id = self.next_sdk_id;
        self.next_sdk_id += 1;
        write_frame(writer, &Frame::SdkRequest { id, call }).await?;

        loop {
            match read_frame(reader).await? {
                Frame::SdkResponse { id: reply_id, reply } if reply_id == id => return Ok(reply),
                Frame::Request { id, call } => self.backlog.push_back((id, call)),
                _ => {}
            }
        }
    }
}
