use anyhow::Result;
use clap::Parser;
use sharedstore::config::AppConfig;
use sharedstore::http::app_server::AppServer;
use sharedstore::StoreRuntime;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "sharedstore-server", about = "Shared store admin server")]
struct Cli {
    /// Path to config file
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let now = Instant::now();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting shared store admin server");

    let config = AppConfig::load(&cli.config)?;
    config.validate()?;

    tracing::info!("Configuration '{}' loaded successfully", &cli.config);

    let runtime = StoreRuntime::from_config(&config)?;

    tracing::info!("Store runtime initialized");

    let app = AppServer::new(runtime);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server started in {}ms", now.elapsed().as_millis());
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app.router).await?;

    Ok(())
}
