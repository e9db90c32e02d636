use std::sync::Arc;

use queryset::interface::QueryInterface;
use queryset::persist::Database;
use queryset::server;
use queryset::settings::Settings;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "queryset stopped");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log.filter)),
        )
        .init();

    let mode = settings.persistence_mode();
    let db = Arc::new(Database::new(mode)?);
    let interface = Arc::new(QueryInterface::new(db));
    let app = server::router(interface);

    let address = settings.address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
