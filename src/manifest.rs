//! Plugin manifest loading and directory discovery.
//!
//! Each plugin lives in its own directory under the plugins root:
//! `<pluginsDir>/<id>/manifest.json`, with the entry executable and the
//! static-asset directory resolved relative to that directory. Manifests are
//! pure data; they are re-read on every discovery pass.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors raised while reading or validating manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid manifest: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Entry executable not found: {0}")]
    EntryNotFound(PathBuf),
}

/// One plugin's descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique id; must match the directory name.
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    /// Command line for the plugin process. Split with POSIX word rules, so
    /// interpreter entries like `"python3 main.py"` work; the program path
    /// resolves inside the plugin directory unless absolute.
    pub entry_path: String,
    /// Directory (relative to the plugin directory) served as static assets.
    #[serde(default = "default_static_asset_dir")]
    pub static_asset_dir: String,
    /// Capability hint used before the process exists; the running plugin's
    /// own metadata is authoritative.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_static_asset_dir() -> String {
    "web".to_string()
}

/// A manifest together with the directory it was found in.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
}

impl PluginManifest {
    /// Load and validate `manifest.json` from one plugin directory.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(ManifestError::NotFound(manifest_path));
        }
        let content =
            fs::read_to_string(&manifest_path).map_err(|e| ManifestError::Io(e.to_string()))?;
        let manifest: PluginManifest = serde_json::from_str(&content).map_err(|e| {
            ManifestError::Invalid(format!("{}: {}", manifest_path.display(), e))
        })?;
        manifest.validate()?;

        // The id names filesystem paths and URLs; it must match the
        // directory it was found in.
        if let Some(dir_name) = dir.file_name().and_then(|n| n.to_str()) {
            if dir_name != manifest.id {
                return Err(ManifestError::Invalid(format!(
                    "manifest id \"{}\" does not match directory \"{}\"",
                    manifest.id, dir_name
                )));
            }
        }
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::Invalid(
                "Plugin id cannot be empty".to_string(),
            ));
        }
        if self
            .id
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == '.')
        {
            return Err(ManifestError::Invalid(format!(
                "Plugin id \"{}\" may not contain whitespace, slashes, or dots. Use kebab-case (e.g., \"my-indexer\")",
                self.id
            )));
        }
        if self.entry_path.trim().is_empty() {
            return Err(ManifestError::Invalid(
                "entryPath cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Split `entryPath` into program and arguments.
    pub fn entry_command(&self) -> Result<(String, Vec<String>), ManifestError> {
        let tokens = shlex::split(&self.entry_path).ok_or_else(|| {
            ManifestError::Invalid(format!("entryPath is not parseable: {}", self.entry_path))
        })?;
        let mut iter = tokens.into_iter();
        let program = iter
            .next()
            .ok_or_else(|| ManifestError::Invalid("entryPath is empty".to_string()))?;
        Ok((program, iter.collect()))
    }

    /// Resolve the entry program against the plugin directory and verify it
    /// exists on disk.
    pub fn resolve_entry(&self, dir: &Path) -> Result<(PathBuf, Vec<String>), ManifestError> {
        let (program, args) = self.entry_command()?;
        let program_path = if Path::new(&program).is_absolute() {
            PathBuf::from(&program)
        } else {
            dir.join(&program)
        };
        if !program_path.exists() {
            return Err(ManifestError::EntryNotFound(program_path));
        }
        Ok((program_path, args))
    }
}

/// Scan the plugins root, loading every directory's manifest.
///
/// A bad entry is logged and collected; it never aborts discovery of the
/// others. A missing root is an empty result, not an error.
pub fn discover(plugins_dir: &Path) -> (Vec<DiscoveredPlugin>, Vec<ManifestError>) {
    let mut found = Vec::new();
    let mut errors = Vec::new();

    if !plugins_dir.exists() {
        debug!(path = ?plugins_dir, "Plugins directory does not exist");
        return (found, errors);
    }
    let entries = match fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = ?plugins_dir, error = %e, "Failed to read plugins directory");
            errors.push(ManifestError::Io(e.to_string()));
            return (found, errors);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match PluginManifest::load(&path) {
            Ok(manifest) => {
                debug!(id = %manifest.id, path = ?path, "Discovered plugin manifest");
                found.push(DiscoveredPlugin {
                    manifest,
                    dir: path,
                });
            }
            Err(ManifestError::NotFound(_)) => {
                debug!(path = ?path, "Directory has no manifest.json, skipping");
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to load plugin manifest");
                errors.push(e);
            }
        }
    }
    found.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
    (found, errors)
}
