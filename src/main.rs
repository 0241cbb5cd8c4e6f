//! Crash table server binary

use clap::Parser;
use crash_table::{
    config::{generate_sample_config, ConfigLoader, CrashConfig},
    errors::{ConfigurationError, CrashResult},
    factory::GameFactory,
    types::UserId,
};
use std::path::PathBuf;
use tracing::info;

/// Crash game server
#[derive(Parser, Debug)]
#[command(name = "crash-table")]
#[command(about = "Real-time crash wagering game server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// RocksDB directory; balances stay in memory when omitted
    #[arg(short, long)]
    db_path: Option<String>,

    /// Credit points before serving, as USER:AMOUNT (repeatable)
    #[arg(long = "fund", value_parser = parse_funding)]
    fund: Vec<(u64, u64)>,

    /// Short betting window and cooldown for local play
    #[arg(long)]
    quick: bool,

    /// Write a sample configuration file and exit
    #[arg(long)]
    generate_config: Option<PathBuf>,
}

fn parse_funding(raw: &str) -> Result<(u64, u64), String> {
    let (user, amount) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected USER:AMOUNT, got '{}'", raw))?;
    let user = user.trim().parse().map_err(|_| format!("invalid user id '{}'", user))?;
    let amount = amount.trim().parse().map_err(|_| format!("invalid amount '{}'", amount))?;
    Ok((user, amount))
}

fn load_config(cli: &Cli) -> CrashResult<CrashConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;

    if cli.quick {
        config.timing = CrashConfig::quick_rounds().timing;
    }
    if let Some(host) = &cli.host {
        config.api.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(path) = &cli.db_path {
        config.storage.db_path = Some(path.clone());
    }

    loader.validate(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> CrashResult<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.generate_config {
        let path = path
            .to_str()
            .ok_or_else(|| ConfigurationError::SaveFailed("config path is not UTF-8".to_string()))?;
        generate_sample_config(path)?;
        println!("Sample configuration written to {}", path);
        return Ok(());
    }

    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_filter.as_str().into()),
        )
        .init();

    info!("Starting crash table v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "   Betting window {}ms, tick {}ms, cooldown {}ms, house edge {}",
        config.timing.betting_window_ms,
        config.timing.tick_interval_ms,
        config.timing.cooldown_ms,
        config.fairness.house_edge
    );

    let store = GameFactory::open_store(&config)?;
    let table = GameFactory::create_table(&config, store).await?;
    for &(user, amount) in &cli.fund {
        table.fund(UserId(user), amount).await?;
    }

    let server = table.api_server(&config);
    server.run().await?;

    table.shutdown().await?;
    info!("Crash table stopped");
    Ok(())
}
