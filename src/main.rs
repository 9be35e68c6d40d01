use std::sync::Arc;

use clap::Parser;
use eventodb::config::Config;
use eventodb::server::{self, AppState};
use eventodb::store::postgres::PgStore;
use eventodb::store::sqlite::SqliteStore;
use eventodb::store::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log))
        .init();

    let store: Arc<dyn Storage> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => Arc::new(SqliteStore::open(&config.data_dir).await?),
    };
    info!(backend = store.backend(), "storage ready");

    let state = AppState::new(store, config.test_mode, config.default_token.clone());
    server::serve(state, config.port).await?;

    Ok(())
}
