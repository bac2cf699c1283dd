//! Modular proxy binary.
//!
//! Reads settings from the environment (and `.env`), discovers plugin
//! modules, and proxies clients to the target until Ctrl+C.
//!
//! Usage:
//!   modular-proxy
//!   modular-proxy --debug

// ============================================================================
// Imports
// ============================================================================

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modular_proxy::plugins::register_bundled;
use modular_proxy::{
    LoadHooks, PluginLoader, PluginRegistry, ProxyServer, Result, Settings, discover_modules,
};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");

    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    init_logging(debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::from_env()?;

    let mut registry = PluginRegistry::new();
    register_bundled(&mut registry);

    let modules = discover_modules(&settings.modules_dir, &settings.layout)?;
    if modules.is_empty() {
        warn!(root = %settings.modules_dir.display(), "No plugin modules found");
    }
    for module in modules.modules() {
        if !registry.contains(module.id()) {
            warn!(module = %module.id(), "Module has no registered plugin and will fail to load");
        }
    }

    let loader = PluginLoader::new(registry, modules, LoadHooks::logging());
    let server = ProxyServer::bind(&settings, loader).await?;

    info!(url = %server.ws_url(), "Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    server.shutdown().await;
    Ok(())
}

/// Initializes tracing; `RUST_LOG` wins over the defaults.
fn init_logging(debug: bool) {
    let fallback = if debug {
        "modular_proxy=debug"
    } else {
        "modular_proxy=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
