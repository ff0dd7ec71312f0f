use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use strategos::config::{AppConfig, ServerConfig};
use strategos::infrastructure::protocol::{ClientOptions, ProtocolClient, StdioConnector};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "strategos", version, about = "Agent orchestration engine")]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every tool advertised by the configured tool servers.
    Catalog,
    /// Call one tool on a configured tool server.
    Call {
        /// Server name from the configuration file.
        #[arg(long)]
        server: String,
        /// Tool name as listed in the catalog.
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(default_value = "{}")]
        arguments: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    info!("Starting strategos");
    let cli = Cli::parse();
    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration using default path or defaults");
    }

    match cli.command {
        Command::Catalog => {
            let mut listing = Vec::new();
            for server in &config.servers {
                let client = connect(server, &config);
                match client.ensure_ready().await {
                    Ok(()) => {
                        let tools = client.tools();
                        debug!(server = %server.name, tools = tools.len(), "catalog fetched");
                        listing.push(json!({ "server": server.name, "tools": tools }));
                    }
                    Err(err) => {
                        warn!(server = %server.name, %err, "server unavailable");
                        listing.push(json!({ "server": server.name, "error": err.to_string() }));
                    }
                }
                client.close().await;
            }
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Call {
            server,
            tool,
            arguments,
        } => {
            let server_config = config
                .servers
                .iter()
                .find(|candidate| candidate.name == server)
                .ok_or_else(|| format!("no configured server named '{server}'"))?;
            let arguments: Value = serde_json::from_str(&arguments)?;
            let client = connect(server_config, &config);
            info!(server = %server, tool = %tool, "calling tool");
            let result = client.call_tool(&tool, arguments).await;
            client.close().await;
            let result = result?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    info!("Done");
    Ok(())
}

fn connect(server: &ServerConfig, config: &AppConfig) -> ProtocolClient {
    ProtocolClient::new(
        server.name.clone(),
        Arc::new(StdioConnector::new(server.clone())),
        ClientOptions::from_config(&config.protocol),
    )
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
