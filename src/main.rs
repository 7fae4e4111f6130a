#[macro_use]
extern crate log;

use std::env::var;
use std::sync::Arc;

mod config;
mod directory;
mod error;
mod peers;
mod protocol;
mod router;
mod session;
mod shell;
mod thrum;

use config::Config;
use shell::Console;
use thrum::Thrum;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG wins when present; otherwise log everything and let the
    // global max level (adjustable via /log) do the filtering.
    if var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Trace)
            .init();

        log::set_max_level(log::LevelFilter::Info);
    }

    let config_loc = var("THRUM_CONFIG").unwrap_or("thrum.toml".into());

    let config: Config = toml::from_slice(&std::fs::read(config_loc)?)?;

    let mut thrum = Thrum::new(config, Arc::new(Console)).await?;

    thrum.up().await?;

    Ok(())
}
