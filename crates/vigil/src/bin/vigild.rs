//! The Vigil server daemon.

use tokio_util::sync::CancellationToken;
use vigil::VigilError;
use vigil::config::ServerConfig;
use vigil::server::VigilServer;

#[tokio::main]
async fn main() -> Result<(), VigilError> {
    vigil::logging::init();

    let config = ServerConfig::from_env()?;
    let server = VigilServer::builder().config(config).build().await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                trigger.cancel();
            }
            Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    server.run(shutdown).await
}
