/// flowway: message-driven flow automation engine
///
/// Reads the configuration file named by `FLOWWAY_CONFIG` or the first
/// argument; without one, defaults plus `FLOWWAY_*` environment variables apply.
/// Serves:
/// - Flow management API at /api/flows/*
/// - Bus control API on pt:j1/mt:cmd/rt:app/rn:flowway/ad:<instance>
/// - Health check at /healthz
use flowway::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::var("FLOWWAY_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));

    let config = match path {
        Some(path) => Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path, e))?,
        None => Config::default(),
    };

    start_server(config).await
}
