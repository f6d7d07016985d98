use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rasid_core::{RasidConfig, ServerConfig};
use rasid_extract::{Fallback, HttpBackend, RuleExtractor, TextUnderstanding};
use rasid_pipeline::Pipeline;
use rasid_server::{router, AppState, JwtVerifier};
use rasid_storage::{create_db, seed_source_patterns};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(JsonStorageLayer)
        .with(BunyanFormattingLayer::new("rasid-server".into(), std::io::stdout))
        .init();

    let path = std::env::var("RASID_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("rasid.toml"));
    let mut config =
        RasidConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    if config.auth.jwt_secret.is_empty() {
        bail!("auth.jwt_secret is empty; set it in the config file or RASID_JWT_SECRET");
    }

    let pool = create_db(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| format!("opening {}", config.database.path.display()))?;
    seed_source_patterns(&pool).await?;
    let verifier = JwtVerifier::new(&config.auth.jwt_secret);

    match HttpBackend::from_config(&config.capability)? {
        Some(remote) => {
            tracing::info!(
                endpoint = %config.capability.endpoint,
                "using remote text understanding"
            );
            let backend = Fallback::new(remote, RuleExtractor::default());
            serve(Pipeline::open(pool, backend, &config).await?, verifier, &config.server).await
        }
        None => {
            tracing::info!("no capability endpoint configured; rules only");
            let pipeline = Pipeline::open(pool, RuleExtractor::default(), &config).await?;
            serve(pipeline, verifier, &config.server).await
        }
    }
}

async fn serve<B: TextUnderstanding + 'static>(
    pipeline: Pipeline<B>,
    verifier: JwtVerifier,
    server: &ServerConfig,
) -> Result<()> {
    let app = router(AppState::new(pipeline, verifier), server.body_limit_bytes);
    let listener = tokio::net::TcpListener::bind(&server.bind)
        .await
        .with_context(|| format!("binding {}", server.bind))?;
    tracing::info!(bind = %server.bind, "rasid server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
