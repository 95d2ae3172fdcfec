use std::sync::Arc;

mod app;
mod config;
mod db;
mod error;
mod media;
mod response;
mod state;
mod storage;
mod users;

use crate::{
    config::AppConfig, state::AppState, storage::Storage, users::repo::PgUserStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "vidtube=debug,axum=info,tower_http=info".to_string());
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

    let config = Arc::new(AppConfig::from_env()?);
    let pool = db::connect(&config.database_url).await?;
    let storage = Storage::new(&config.storage).await?;

    let state = AppState::from_parts(
        config,
        Arc::new(PgUserStore::new(pool)),
        Arc::new(storage),
    );

    app::serve(app::build_app(state)).await
}
