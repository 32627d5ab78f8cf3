use clap::Parser;
use fleet::config::Args;
use fleet::proxy::Proxy;
use fleet::runtime::{DockerCli, Runtime};
use fleet::session::Session;
use fleet::state::SessionData;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let session_config = args.session_config();
    let proxy_config = args.proxy_config();

    // Anything failing before the loops start is fatal
    let runtime: Arc<dyn Runtime> = Arc::new(DockerCli::connect(&args.docker).await?);
    let data = SessionData::load(&session_config.state_file)?;
    info!(
        "Starting {} replicas of {} at attempt #{}",
        session_config.replicas, session_config.image, data.attempt
    );

    let (target_tx, target_rx) = watch::channel(String::new());
    let proxy = Proxy::bind(&proxy_config, target_rx).await?;
    let session = Session::new(runtime, &session_config, data, target_tx);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    });

    let proxy_handle = tokio::spawn(proxy.run(shutdown.clone()));
    let replica_handles = session.spawn_replicas(&shutdown);

    let result = session.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = proxy_handle.await {
        error!("Proxy task panicked: {}", e);
    }
    for handle in replica_handles {
        if let Err(e) = handle.await {
            error!("Replica task panicked: {}", e);
        }
    }

    result?;
    Ok(())
}
