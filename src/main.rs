use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use session_broker::api;
use session_broker::config::Config;
use session_broker::engine::{EngineConfig, InteractionEngine};
use session_broker::prepare::{prepare_home, write_credentials, CredentialFile};

fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Resolve `REL=SRC` credential specs into contents to place in the home.
fn load_credentials(specs: &[String]) -> Result<Vec<CredentialFile>> {
    specs
        .iter()
        .map(|spec| {
            let (rel, src) = spec
                .split_once('=')
                .with_context(|| format!("credential '{spec}' is not in REL=SRC form"))?;
            let contents = std::fs::read_to_string(src)
                .with_context(|| format!("failed to read credential source '{src}'"))?;
            Ok(CredentialFile {
                relative_path: rel.to_string(),
                contents,
            })
        })
        .collect()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(target: "session_broker", "shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let workspace = match &cfg.workspace {
        Some(ws) => ws.clone(),
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    let home = prepare_home(&workspace, cfg.home_dir.as_deref())?;
    write_credentials(&home, &load_credentials(&cfg.credentials)?)?;
    tracing::info!(target: "session_broker", home = %home.display(), "session home prepared");

    let launch = cfg.launch_config(home.clone());
    let engine = InteractionEngine::new(EngineConfig {
        home_dir: home,
        notify_filename: cfg.notify_file.clone(),
        launch,
    });

    let addr = format!("127.0.0.1:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(target: "session_broker", addr = %addr, "API listening");

    axum::serve(listener, api::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    engine.destroy().await;
    Ok(())
}
