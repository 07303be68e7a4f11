mod admin;
mod app;
mod auth;
mod config;
mod entitlement;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "taskdesk=debug,axum=info,tower_http=info".to_string());
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

    let app_state = state::AppState::init().await?;

    // Run migrations if present
    if let Err(e) = sqlx::migrate!("./migrations").run(&app_state.db).await {
        tracing::warn!(error = %e, "migrations folder not found or migration failed; continuing");
    }

    // One sweep loop per process, stopped after the server drains.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = tokio::spawn(entitlement::services::sweep_loop(
        app_state.entitlements.clone(),
        app_state.config.sweep.clone(),
        shutdown_rx,
    ));

    let app = app::build_app(app_state);
    app::serve(app).await?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;

    Ok(())
}
