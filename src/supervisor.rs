//! Plugin process supervisor.
//!
//! Owns the full lifecycle of every plugin: discovery, process spawn,
//! handshake, capability introspection, the registry of running plugins,
//! enable/disable with persistence, and shutdown. All state mutations are
//! serialized through a single load lock; lookups go through a read lock on
//! the registry and never wait on a load in progress.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::manifest::{self, ManifestError, PluginManifest};
use crate::protocol::{
    EventPayload, PluginMetadata, RouteDescriptor, UiManifest, HANDSHAKE_TOKEN_ENV,
};
use crate::rpc::{PluginRpc, RpcClient, RpcError};
use crate::store::Store;
use crate::transport::{Connection, SdkHandler, TransportError};

/// Errors raised by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin is disabled: {0}")]
    Disabled(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Failed to spawn plugin process: {0}")]
    Spawn(String),

    #[error("Handshake failed: {0}")]
    Handshake(TransportError),

    #[error("Plugin reported id \"{reported}\" but manifest says \"{expected}\"")]
    IdentityMismatch { expected: String, reported: String },

    #[error("Metadata call failed: {0}")]
    Metadata(RpcError),

    #[error("Store error: {0}")]
    Store(String),
}

/// A running plugin: its process, its connection, and everything the host
/// learned about it at load time.
#[derive(Debug)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
    pub metadata: PluginMetadata,
    pub routes: Vec<RouteDescriptor>,
    pub ui_manifest: Option<UiManifest>,
    pub is_indexer: bool,
    pub is_downloader: bool,
    pub pid: Option<u32>,
    conn: Arc<Connection>,
    rpc: Arc<RpcClient>,
    child: Mutex<Child>,
}

impl LoadedPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn rpc(&self) -> Arc<dyn PluginRpc> {
        self.rpc.clone()
    }

    /// Whether the RPC connection to the process is still up.
    pub fn is_alive(&self) -> bool {
        !self.conn.is_closed()
    }

    /// Tear down the connection and force-kill the process. Already-dead
    /// processes are fine; the error is logged and swallowed.
    async fn terminate(&self) {
        self.conn.close().await;
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(plugin = %self.id(), error = %e, "Plugin process already exited");
        }
        // Reap so no zombie lingers if kill() raced the exit.
        let _ = child.wait().await;
    }
}

/// Summary row for the plugin listing API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub enabled: bool,
    pub running: bool,
    pub is_indexer: bool,
    pub is_downloader: bool,
    pub capabilities: Vec<String>,
}

pub struct PluginSupervisor {
    plugins_dir: PathBuf,
    store: Arc<Store>,
    sdk: Arc<dyn SdkHandler>,
    /// Budget for the handshake and each load-time introspection call.
    load_timeout: Duration,
    table: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    /// Serializes load/unload/enable/disable so two loads of the same id
    /// cannot race past the duplicate check.
    load_lock: Mutex<()>,
}

impl PluginSupervisor {
    pub fn new(
        plugins_dir: PathBuf,
        store: Arc<Store>,
        sdk: Arc<dyn SdkHandler>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            plugins_dir,
            store,
            sdk,
            load_timeout,
            table: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn plugins_dir(&self) -> &PathBuf {
        &self.plugins_dir
    }

    /// Discover every plugin on disk and load the enabled ones. A plugin
    /// that fails to load is logged and skipped; startup continues.
    pub async fn initialize(&self) {
        let (discovered, errors) = manifest::discover(&self.plugins_dir);
        for e in &errors {
            warn!(error = %e, "Skipping unreadable plugin directory");
        }
        info!(count = discovered.len(), path = ?self.plugins_dir, "Discovered plugins");

        for found in discovered {
            let id = found.manifest.id.clone();
            match self.load_plugin(&id).await {
                Ok(plugin) => {
                    info!(
                        plugin = %id,
                        version = %plugin.metadata.version,
                        indexer = plugin.is_indexer,
                        downloader = plugin.is_downloader,
                        "Plugin loaded"
                    );
                }
                Err(SupervisorError::Disabled(_)) => {
                    debug!(plugin = %id, "Plugin is disabled, not loading");
                }
                Err(e) => {
                    warn!(plugin = %id, error = %e, "Failed to load plugin");
                }
            }
        }
    }

    /// Spawn one plugin and add it to the registry.
    pub async fn load_plugin(&self, id: &str) -> Result<Arc<LoadedPlugin>, SupervisorError> {
        let _guard = self.load_lock.lock().await;
        if self.table.read().await.contains_key(id) {
            return Err(SupervisorError::AlreadyLoaded(id.to_string()));
        }

        let dir = self.plugins_dir.join(id);
        let manifest = PluginManifest::load(&dir)?;
        let enabled = self
            .store
            .record_plugin(id)
            .map_err(|e| SupervisorError::Store(e.to_string()))?;
        if !enabled {
            return Err(SupervisorError::Disabled(id.to_string()));
        }

        let plugin = self.spawn_and_introspect(manifest, dir).await?;
        if let Err(e) = self.store.update_plugin_details(
            id,
            &plugin.metadata.name,
            &plugin.metadata.description,
            &plugin.metadata.version,
            &plugin.metadata.capabilities,
        ) {
            warn!(plugin = %id, error = %e, "Failed to persist plugin metadata");
        }
        self.table
            .write()
            .await
            .insert(id.to_string(), plugin.clone());
        Ok(plugin)
    }

    /// Remove a plugin from the registry and kill its process.
    pub async fn unload_plugin(&self, id: &str) -> Result<(), SupervisorError> {
        let _guard = self.load_lock.lock().await;
        let plugin = self
            .table
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        plugin.terminate().await;
        info!(plugin = %id, "Plugin unloaded");
        Ok(())
    }

    /// Persist enabled=true and load the plugin if it is not running.
    /// The flag is written first so the choice survives a failed load.
    pub async fn enable_plugin(&self, id: &str) -> Result<(), SupervisorError> {
        self.store
            .set_plugin_enabled(id, true)
            .map_err(|e| SupervisorError::Store(e.to_string()))?;
        match self.load_plugin(id).await {
            Ok(_) | Err(SupervisorError::AlreadyLoaded(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Persist enabled=false and stop the plugin if it is running.
    pub async fn disable_plugin(&self, id: &str) -> Result<(), SupervisorError> {
        self.store
            .set_plugin_enabled(id, false)
            .map_err(|e| SupervisorError::Store(e.to_string()))?;
        match self.unload_plugin(id).await {
            Ok(()) | Err(SupervisorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Look up a running plugin.
    pub async fn get(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.table.read().await.get(id).cloned()
    }

    /// Every plugin on disk, with its persisted flag and live state.
    pub async fn list(&self) -> Vec<PluginInfo> {
        let (discovered, _) = manifest::discover(&self.plugins_dir);
        let table = self.table.read().await;

        discovered
            .into_iter()
            .map(|found| {
                let id = found.manifest.id.clone();
                let enabled = self
                    .store
                    .plugin_enabled(&id)
                    .ok()
                    .flatten()
                    .unwrap_or(true);
                match table.get(&id) {
                    Some(p) => PluginInfo {
                        id,
                        name: p.metadata.name.clone(),
                        version: p.metadata.version.clone(),
                        description: p.metadata.description.clone(),
                        enabled,
                        running: p.is_alive(),
                        is_indexer: p.is_indexer,
                        is_downloader: p.is_downloader,
                        capabilities: p.metadata.capabilities.clone(),
                    },
                    None => PluginInfo {
                        id,
                        name: found.manifest.display_name.clone(),
                        version: found.manifest.version.clone(),
                        description: String::new(),
                        enabled,
                        running: false,
                        is_indexer: false,
                        is_downloader: false,
                        capabilities: found.manifest.capabilities.clone(),
                    },
                }
            })
            .collect()
    }

    /// Snapshot of every running plugin, ordered by id.
    pub async fn loaded(&self) -> Vec<Arc<LoadedPlugin>> {
        let table = self.table.read().await;
        let mut out: Vec<Arc<LoadedPlugin>> = table.values().cloned().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Running plugins that answer search queries, ordered by id.
    pub async fn indexers(&self) -> Vec<(String, Arc<dyn PluginRpc>)> {
        let table = self.table.read().await;
        let mut out: Vec<(String, Arc<dyn PluginRpc>)> = table
            .values()
            .filter(|p| p.is_indexer)
            .map(|p| (p.id().to_string(), p.rpc()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Deliver an event to every running plugin, best effort. Failures are
    /// logged; plugins that do not handle events are left alone.
    pub async fn broadcast_event(&self, topic: &str, data: Value) {
        let plugins: Vec<Arc<LoadedPlugin>> =
            self.table.read().await.values().cloned().collect();
        let deliveries = plugins.iter().map(|p| {
            let payload = EventPayload {
                topic: topic.to_string(),
                data: data.clone(),
            };
            async move {
                match timeout(self.load_timeout, p.rpc.handle_event(payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(RpcError::Plugin { .. })) => {
                        debug!(plugin = %p.id(), topic, "Plugin declined event");
                    }
                    Ok(Err(e)) => {
                        warn!(plugin = %p.id(), topic, error = %e, "Event delivery failed");
                    }
                    Err(_) => {
                        warn!(plugin = %p.id(), topic, "Event delivery timed out");
                    }
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }

    /// Stop everything: announce shutdown, then kill every plugin process.
    /// Tolerant of plugins that already died.
    pub async fn shutdown(&self) {
        self.broadcast_event("host.shutdown", Value::Null).await;

        let _guard = self.load_lock.lock().await;
        let drained: Vec<(String, Arc<LoadedPlugin>)> =
            self.table.write().await.drain().collect();
        for (id, plugin) in drained {
            plugin.terminate().await;
            debug!(plugin = %id, "Plugin stopped");
        }
        info!("All plugins stopped");
    }

    async fn spawn_and_introspect(
        &self,
        manifest: PluginManifest,
        dir: PathBuf,
    ) -> Result<Arc<LoadedPlugin>, SupervisorError> {
        let (program, args) = manifest.resolve_entry(&dir)?;
        let token = handshake_token();

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&dir)
            .env(HANDSHAKE_TOKEN_ENV, &token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SupervisorError::Spawn(format!("{}: {}", program.display(), e))
            })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn("stdout not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Spawn("stdin not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(manifest.id.clone(), stderr);
        }

        let (conn, hello) = match Connection::establish(
            stdout,
            stdin,
            &token,
            self.load_timeout,
            self.sdk.clone(),
        )
        .await
        {
            Ok(established) => established,
            Err(e) => {
                let _ = child.kill().await;
                return Err(SupervisorError::Handshake(e));
            }
        };
        if hello.plugin_id != manifest.id {
            let _ = child.kill().await;
            return Err(SupervisorError::IdentityMismatch {
                expected: manifest.id.clone(),
                reported: hello.plugin_id,
            });
        }

        let conn = Arc::new(conn);
        let rpc = Arc::new(RpcClient::new(conn.clone()));

        // Metadata is the one mandatory call. A plugin that cannot answer
        // it does not get registered.
        let metadata = match timeout(self.load_timeout, rpc.metadata()).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) => {
                conn.close().await;
                let _ = child.kill().await;
                return Err(SupervisorError::Metadata(e));
            }
            Err(_) => {
                conn.close().await;
                let _ = child.kill().await;
                return Err(SupervisorError::Metadata(RpcError::Transport(
                    TransportError::Timeout(self.load_timeout),
                )));
            }
        };

        // The remaining introspection calls are optional; a plugin that
        // does not support one degrades instead of failing the load.
        let id = manifest.id.clone();
        let routes = self
            .optional_call(&id, "apiRoutes", rpc.api_routes(), Vec::new())
            .await;
        let ui_manifest = self
            .optional_call(&id, "uiManifest", async { rpc.ui_manifest().await.map(Some) }, None)
            .await;
        let is_indexer = self
            .optional_call(&id, "isIndexer", rpc.is_indexer(), false)
            .await;
        let is_downloader = self
            .optional_call(&id, "isDownloader", rpc.is_downloader(), false)
            .await;

        Ok(Arc::new(LoadedPlugin {
            manifest,
            dir,
            metadata,
            routes,
            ui_manifest,
            is_indexer,
            is_downloader,
            pid,
            conn,
            rpc,
            child: Mutex::new(child),
        }))
    }

    /// Run one optional introspection call under the load timeout, falling
    /// back to a default when the plugin cannot or will not answer.
    async fn optional_call<T, F>(&self, id: &str, what: &str, call: F, default: T) -> T
    where
        F: std::future::Future<Output = Result<T, RpcError>>,
    {
        match timeout(self.load_timeout, call).await {
            Ok(Ok(value)) => value,
            Ok(Err(RpcError::Plugin { .. })) => {
                debug!(plugin = %id, call = what, "Plugin does not support call");
                default
            }
            Ok(Err(e)) => {
                warn!(plugin = %id, call = what, error = %e, "Introspection call failed");
                default
            }
            Err(_) => {
                warn!(plugin = %id, call = what, "Introspection call timed out");
                default
            }
        }
    }
}

/// Fresh per-spawn secret passed to the child through its environment and
/// echoed back in the hello frame.
fn handshake_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Mirror a plugin's stderr into the host log, one line at a time.
fn forward_stderr(plugin_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(plugin = %plugin_id, "{}", line);
        }
    });
}
