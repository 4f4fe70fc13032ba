#![no_main]

use libfuzzer_sys::fuzz_target;
use medley::bridge::resolve_static_asset;
use std::path::PathBuf;
use std::sync::OnceLock;

static PLUGIN_DIR: OnceLock<PathBuf> = OnceLock::new();

/// One plugin directory shared across iterations, with a real asset inside
/// the web root and bait files outside it.
fn plugin_dir() -> &'static PathBuf {
    PLUGIN_DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        std::fs::create_dir_all(dir.join("web")).expect("web dir");
        std::fs::write(dir.join("web").join("index.html"), b"ok").expect("asset");
        std::fs::write(dir.join("secret.txt"), b"outside").expect("bait");
        dir
    })
}

fuzz_target!(|relative: &str| {
    let dir = plugin_dir();
    if let Ok(resolved) = resolve_static_asset(dir, "web", relative) {
        let web = dir.join("web").canonicalize().expect("web root");
        assert!(
            resolved.starts_with(&web),
            "resolved path escaped the asset root: {resolved:?}"
        );
    }
});
