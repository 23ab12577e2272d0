use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gatehouse::{ManifestRegistry, ModuleRegistry};
use tokio::task::JoinSet;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Initialise structured logging from `LOG_FORMAT` (text|json) and
/// `LOG_LEVEL` (debug|info|warn|error); `RUST_LOG` still wins when set.
fn init_logging() {
    let level = match env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("GATEHOUSE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read configuration {config_path:?}"))?;

    let registry = ManifestRegistry::builtin()?;
    let proxies = registry
        .decode_proxies(&raw)
        .context("proxy initialization failed")?;
    let mods = registry
        .decode_modules(&raw)
        .context("proxy modules initialization failed")?;
    if proxies.is_empty() {
        bail!("configuration declares no AuthProxy");
    }

    let modules = Arc::new(ModuleRegistry::default());
    for module in mods {
        modules.register(module);
    }

    let mut listeners = JoinSet::new();
    for proxy in proxies {
        let modules = modules.clone();
        let name = proxy.name().to_string();
        tracing::info!(proxy_name = %name, "starting proxy");
        listeners.spawn(async move {
            if let Err(err) = proxy.listen_and_serve(modules).await {
                tracing::error!(proxy_name = %name, error = %format!("{err:#}"), "proxy failed");
            }
        });
    }
    while listeners.join_next().await.is_some() {}
    Ok(())
}
