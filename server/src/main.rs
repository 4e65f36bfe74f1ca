mod db;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use crate::store::{MemoryRecordStore, PgRecordStore, RecordStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let store: Arc<dyn RecordStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => Arc::new(PgRecordStore::new(db::init_pool(&database_url).await?)),
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; board objects are kept in memory only");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let app = routes::app(state::AppState::new(store));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "boardsync relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
