use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use profile_service::{app, events::consumer::EventConsumer, grpc, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "profile_service=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let state = AppState::init().await?;
    let http_addr = state.config.http_addr()?;
    let grpc_addr = state.config.grpc_addr()?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let consumer = Arc::new(EventConsumer::new(
        state.backends.repo.clone(),
        state.backends.storage.clone(),
        state.backends.stream.clone(),
    ));
    let consumer_task = tokio::spawn(consumer.run(cancel.clone()));
    let grpc_task = tokio::spawn(grpc::serve(grpc_addr, state.users.clone(), cancel.clone()));

    let http = app::serve(app::build_app(state), http_addr, cancel.clone()).await;
    // a failed listener takes the rest of the process down with it
    cancel.cancel();

    match grpc_task.await {
        Ok(Err(e)) => tracing::error!(error = %format!("{e:#}"), "grpc server failed"),
        Err(e) => tracing::error!(error = %e, "grpc task panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = consumer_task.await {
        tracing::error!(error = %e, "event consumer panicked");
    }

    http?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => return,
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
