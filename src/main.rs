mod abort;
mod broadcast;
mod codec;
mod config;
mod ethereum;
mod lookup;
mod server;

use anyhow::Result;
use clap::{Arg, Command};
use config::Config;
use server::RawTxMcpServer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let matches = Command::new("rawtx-mcp")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MCP server for decoding, simulating and broadcasting raw blockchain transactions")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Default network to use (ethereum, sepolia, base, polygon, arbitrum)"),
        )
        .arg(
            Arg::new("rpc-url")
                .short('r')
                .long("rpc-url")
                .value_name("URL")
                .help("RPC endpoint URL for the default network"),
        )
        .arg(
            Arg::new("allow-broadcast")
                .long("allow-broadcast")
                .help("Allow sending signed transactions to chain endpoints")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("decode")
                .short('d')
                .long("decode")
                .value_name("RAW_TX")
                .help("Decode a raw transaction (hex or base64), print it as JSON and exit"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a sample configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("save-config")
                .long("save-config")
                .value_name("FILE")
                .help("Write the effective configuration, after command line overrides, to FILE and exit"),
        )
        .arg(
            Arg::new("config-path")
                .long("config-path")
                .help("Print the default configuration file path and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("generate-config") {
        println!("{}", Config::generate_sample());
        return Ok(());
    }

    if matches.get_flag("config-path") {
        match Config::default_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return Ok(());
            }
            Err(e) => {
                error!("Could not determine default config path: {}", e);
                return Err(e);
            }
        }
    }

    if let Some(raw) = matches.get_one::<String>("decode") {
        let summary = server::decode_summary(raw)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let mut config = Config::load_or_default(config_path).await;

    if let Some(network) = matches.get_one::<String>("network") {
        config.default_network = network.clone();
    }

    if let Some(rpc_url) = matches.get_one::<String>("rpc-url") {
        if let Some(network_config) = config.networks.get_mut(&config.default_network) {
            network_config.rpc_url = rpc_url.clone();
        }
    }

    if matches.get_flag("allow-broadcast") {
        config.security.allow_broadcast = true;
    }

    if let Some(path) = matches.get_one::<String>("save-config") {
        config.save_to_file(path).await?;
        info!("Configuration written to {}", path);
        return Ok(());
    }

    info!("Default network: {}", config.default_network);
    info!("Broadcasting allowed: {}", config.security.allow_broadcast);

    let server = RawTxMcpServer::new(config)?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
