//! Medley - self-hosted media library manager
//!
//! Hosts out-of-process plugins behind a supervised RPC boundary.

use clap::{Parser, Subcommand};
use std::fs;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medley::config::{self, AppConfig};
use medley::manifest;
use medley::server;
use medley::store::Store;

#[derive(Parser)]
#[command(name = "medley")]
#[command(author, version, about = "Self-hosted media library manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the medley data directory and a starter configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Start the medley server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Inspect and manage plugins
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Show current configuration
    Config,

    /// Check configuration, data directory, and plugin manifests
    Doctor,
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List every known plugin and its state
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "medley=debug,tower_http=debug"
    } else {
        "medley=info,tower_http=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Init { force } => cmd_init(force),
        Commands::Serve { port, host } => cmd_serve(port, host).await,
        Commands::Plugins { command } => match command {
            PluginCommands::List => cmd_plugins_list(),
        },
        Commands::Config => cmd_config(),
        Commands::Doctor => cmd_doctor(),
    }
}

/// Initialize the data directory and write a starter config
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let data_dir = config::data_dir();
    let config_file = data_dir.join("config.yaml");

    if config_file.exists() && !force {
        error!("Configuration already exists. Use --force to overwrite.");
        return Ok(());
    }

    fs::create_dir_all(&data_dir)?;
    fs::create_dir_all(data_dir.join("plugins"))?;

    let default_config = r#"# Medley Configuration

server:
  host: "127.0.0.1"
  port: 7878

plugins:
  enabled: true
  # dir: ~/.medley/plugins
  # load_timeout_secs: 10

search:
  plugin_timeout_secs: 30

# auth:
#   session_token: change-me
#   admin_token: change-me-too
"#;
    fs::write(&config_file, default_config)?;

    println!("Initialized medley at {:?}", data_dir);
    println!("  Configuration: {:?}", config_file);
    println!("  Plugins: {:?}", data_dir.join("plugins"));
    Ok(())
}

/// Start the server
async fn cmd_serve(port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut config = load_or_die()?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", e);
    }

    server::run_server(config).await
}

/// List plugins from the store and the plugin directory
fn cmd_plugins_list() -> anyhow::Result<()> {
    let config = load_or_die()?;
    let store = Store::open(&config.database.path)?;
    let rows = store.list_plugins()?;
    let (discovered, _) = manifest::discover(&config.plugins.dir);

    println!("Medley Plugins\n");
    if rows.is_empty() && discovered.is_empty() {
        println!("No plugins found in {:?}", config.plugins.dir);
        return Ok(());
    }

    for row in &rows {
        let on_disk = discovered.iter().any(|d| d.manifest.id == row.id);
        println!(
            "  {} {} ({}) - {}{}",
            if row.enabled { "[enabled] " } else { "[disabled]" },
            row.id,
            if row.version.is_empty() { "?" } else { &row.version },
            if row.name.is_empty() { &row.id } else { &row.name },
            if on_disk { "" } else { " [missing from disk]" },
        );
    }
    for found in &discovered {
        if !rows.iter().any(|r| r.id == found.manifest.id) {
            println!(
                "  [new]      {} ({}) - {}",
                found.manifest.id, found.manifest.version, found.manifest.display_name
            );
        }
    }
    Ok(())
}

/// Show current configuration
fn cmd_config() -> anyhow::Result<()> {
    let config = load_or_die()?;
    println!("Medley Configuration\n");
    println!("Server:");
    println!("  Host: {}", config.server.host);
    println!("  Port: {}", config.server.port);
    println!();
    println!("Database:");
    println!("  Path: {:?}", config.database.path);
    println!();
    println!("Plugins:");
    println!("  Enabled: {}", config.plugins.enabled);
    println!("  Directory: {:?}", config.plugins.dir);
    println!("  Load timeout: {}s", config.plugins.load_timeout_secs);
    println!();
    println!("Search:");
    println!("  Per-plugin timeout: {}s", config.search.plugin_timeout_secs);
    println!();
    println!("Auth:");
    println!(
        "  Session token: {}",
        if config.auth.session_token.is_some() { "configured" } else { "not set" }
    );
    println!(
        "  Admin token: {}",
        if config.auth.admin_token.is_some() { "configured" } else { "not set" }
    );
    Ok(())
}

/// Check configuration and the plugin directory
fn cmd_doctor() -> anyhow::Result<()> {
    println!("Medley Doctor\n");

    print!("Configuration... ");
    let config = match config::load_config() {
        Ok(config) => {
            println!("OK");
            config
        }
        Err(e) => {
            println!("FAILED: {}", e);
            println!("\nRun 'medley init' to create a configuration file.");
            return Ok(());
        }
    };
    if let Err(e) = config.validate() {
        println!("  Invalid: {}", e);
    }

    print!("Database... ");
    match Store::open(&config.database.path) {
        Ok(_) => println!("OK ({:?})", config.database.path),
        Err(e) => println!("FAILED: {}", e),
    }

    print!("Plugins directory... ");
    if config.plugins.dir.exists() {
        println!("OK ({:?})", config.plugins.dir);
    } else {
        println!("NOT FOUND ({:?})", config.plugins.dir);
    }

    let (discovered, errors) = manifest::discover(&config.plugins.dir);
    for found in &discovered {
        print!("  {} ... ", found.manifest.id);
        match found.manifest.resolve_entry(&found.dir) {
            Ok((program, _)) => println!("OK (entry {:?})", program),
            Err(e) => println!("BROKEN: {}", e),
        }
    }
    for e in &errors {
        println!("  manifest error: {}", e);
    }
    if discovered.is_empty() && errors.is_empty() {
        println!("  no plugins installed");
    }

    Ok(())
}

fn load_or_die() -> anyhow::Result<AppConfig> {
    config::load_config().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
