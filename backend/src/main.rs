use std::path::PathBuf;

use backend::Exchange;
use tracing::info;

fn main() -> Result<(), backend::ExchangeError> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backend=debug".into()),
        )
        .init();

    let db_path = std::env::var("SANTA_DB").unwrap_or_else(|_| "santa.db".into());
    let exchange = Exchange::open(&PathBuf::from(&db_path))?;

    let groups = exchange.group_count()?;
    info!("store ready with {groups} groups");
    Ok(())
}
