pub mod commands;
pub mod config;
pub mod store;
pub mod voice_rooms;

use anyhow::Result;
use config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // Settings first so a RUST_LOG from .env is visible to the logger
    let settings = Settings::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Data directory: {}", settings.data_dir.display());
    commands::start(settings).await
}
