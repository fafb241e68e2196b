use anyhow::Context;

use batchforge_infra::BatchConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to load .env");
        }
    }
    batchforge_observability::init();

    let config = BatchConfig::from_env().context("invalid configuration")?;
    let services = batchforge_api::app::services::build_services(&config).await?;
    let app = batchforge_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, persistent = config.use_persistent_stores, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
