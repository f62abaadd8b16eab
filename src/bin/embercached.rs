//! Cache server daemon: default configuration, ctrl-c for graceful
//! shutdown. Option parsing and config files belong to the embedding
//! environment; this binary only wires the pieces together.

use embercache::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::default();
    let server = Server::new(config)?;

    let shutdown = server.shutdown_trigger();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.send(()).ok();
        }
    });

    server.run().await?;
    Ok(())
}
