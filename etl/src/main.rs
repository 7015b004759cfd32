use anyhow::Context;
use clap::{Arg, Command};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let matches = Command::new("playlog-etl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds the listening analytics tables from song and event logs")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("dl.cfg")
                .help("Sets a custom config file"),
        )
        .get_matches();

    common::logging::init_tracing();

    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or("dl.cfg");

    if let Err(e) = run(config_path).await {
        error!("ETL pipeline error: {:#}", e);
        process::exit(1);
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    etl::run_etl_pipeline(config_path)
        .await
        .with_context(|| format!("Pipeline failed with config {}", config_path))?;
    Ok(())
}
