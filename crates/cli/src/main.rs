mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::BridgeConfig;
use kbridge_core::event_channel;
use kbridge_gateways_common::SimulatedGateway;
use kbridge_market::Market;
use kbridge_proxy::{ProxyServer, RemoteMarket};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "kbridge")]
#[command(about = "Awaitable facade and JSON-lines proxy over a callback-driven broker terminal")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "KBRIDGE_LOG_LEVEL")]
    log_level: String,

    /// Path to a TOML config file
    #[arg(short, long, env = "KBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server over the simulated gateway
    Serve {
        /// Bind address (overrides the config file)
        #[arg(short, long, env = "KBRIDGE_BIND")]
        bind: Option<String>,
    },

    /// Connect to a running proxy, log in and print the account state
    Probe {
        /// Proxy address (defaults to the configured bind address)
        #[arg(short, long)]
        addr: Option<String>,

        /// Also register and print the price of this instrument code
        #[arg(long)]
        code: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await?;
        }
        Commands::Probe { addr, code } => {
            let addr = addr.unwrap_or_else(|| config.server.bind.clone());
            probe(&addr, code, &config).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn serve(config: BridgeConfig) -> Result<()> {
    let (sink, events) = event_channel();
    let gateway = Arc::new(SimulatedGateway::new(config.simulator, sink));
    let feed = gateway.clone().spawn_feed();
    let market = Arc::new(Market::new(gateway, events, config.market));

    tracing::info!(bind = %config.server.bind, "Starting proxy over the simulated gateway");
    let server = ProxyServer::new(market, config.server);

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }
    feed.abort();

    Ok(())
}

async fn probe(addr: &str, code: Option<String>, config: &BridgeConfig) -> Result<()> {
    let remote = RemoteMarket::connect(addr, config.market.request_timeout()).await?;

    remote.login().await?;
    let account = remote.load_account_number().await?;
    let deposit = remote.get_deposit().await?;
    let holdings = remote.get_balance().await?;
    let conditions = remote.get_condition_list().await?;

    let sep = "=".repeat(60);
    println!("\n{sep}");
    println!("  ACCOUNT {account}");
    println!("{sep}");
    println!("  Deposit:         {deposit} KRW");
    println!("  Holdings:        {}", holdings.len());
    for entry in holdings.values() {
        println!(
            "    {} {:<12} held {:>6}  available {:>6}  avg {}",
            entry.code, entry.name, entry.held_quantity, entry.available_quantity, entry.average_cost
        );
    }
    println!("  Conditions:      {}", conditions.len());
    for condition in &conditions {
        println!("    [{}] {}", condition.index, condition.name);
    }

    if let Some(code) = code {
        remote.register_price_feed(&[code.clone()], false).await?;
        let quote = remote.get_price(&code).await?;
        println!(
            "  {code}:          last {}  open {}  high {}  low {}",
            quote.last, quote.open, quote.high, quote.low
        );
    }
    println!("{sep}\n");

    Ok(())
}
