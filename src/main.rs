use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vibe::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vibe=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        code_model = %config.llm.code_model,
        template = %config.sandbox.template,
        "Starting vibe server"
    );

    vibe::api::serve(config).await
}
