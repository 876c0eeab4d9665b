use std::process::ExitCode;
use std::sync::Arc;

use jobrelay_api::app::services::build_services;
use jobrelay_infra::ServiceConfig;

#[tokio::main]
async fn main() -> ExitCode {
    jobrelay_observability::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "jobrelay-api stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;
    let http_addr = config.http_addr.clone();

    let services = Arc::new(tokio::task::spawn_blocking(move || build_services(config)).await??);
    let registry = services.registry();
    tracing::info!(
        jobs = ?registry.names(),
        env = %services.config().deploy_env,
        "services ready"
    );

    let running = services.start_subscriptions();
    let mut subscriptions = tokio::task::spawn_blocking(move || running.supervise());

    let app = jobrelay_api::app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let shutdown = services.shutdown_token().clone();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                shutdown.cancel();
            })
            .await
    };

    tokio::select! {
        served = server => {
            served?;
            // Server stopped on ctrl-c; wait for the loops to wind down.
            services.shutdown_token().cancel();
            subscriptions.await??;
        }
        failed = &mut subscriptions => {
            failed??;
            anyhow::bail!("subscriptions stopped unexpectedly");
        }
    }
    Ok(())
}
