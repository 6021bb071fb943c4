use proximity::config::Config;
use proximity::telemetry::{init_tracing, shutdown_signal};
use proximity::{ProximityService, http};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> proximity::Result<()> {
    let cfg = Config::load()?;
    init_tracing(&cfg.log)?;

    let addr = cfg.server.socket_addr()?;
    let service = ProximityService::open(cfg).await?;
    service.start_maintenance();

    info!(%addr, version = proximity::VERSION, "starting proximity server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http::router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await?;
    warn!("shutdown complete");
    Ok(())
}
