use anyhow::Error;
use clap::Parser;

use dubq::config::ConfigContext;
use dubq::{server, telemetry};
use std::env;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(cancel_token.clone(), config).await {
                    error!("Error starting server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("server")),
        )
    };

    info!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "dubq=DEBUG,tower_http=INFO");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;
    info!(message = "Starting", bind = %config.bind, upload_dir = ?config.upload_dir);

    let token = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let app = tokio::spawn(setup(token.clone(), config));

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
            _ = token.cancelled() => {},
        }
    });
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
