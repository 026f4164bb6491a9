//! `vita-ske` binary argument parsing: global args flattened onto every
//! subcommand, one `handle_*` method per variant.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::config::manager::ConfigManager;
use crate::config::ManagerConfig;
use crate::logging::{self, audit::AuditLog, LoggingConfig};
use crate::manager::KeyManager;
use crate::metrics::Counters;

/// UDP port the exchange channel runs on for this crate's own transport
/// carrier. The real data plane wraps the wire format in a raw IPv4 datagram
/// (protocol 99); that wrapping, like NIC plumbing generally, belongs to an
/// external collaborator process. This binary's `run` command carries the
/// same 8-byte Transport header and bodies over UDP so the exchange can be
/// exercised end-to-end without a privileged raw socket.
const EXCHANGE_PORT: u16 = 4500;

/// Interval between [`KeyManager::tick`] calls while running.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "vita-ske")]
#[command(about = "vita-ske1 key management core for the Vita IPsec/ESP gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Configuration file path (YAML or JSON, by extension).
    #[arg(short, long, global = true, default_value = "vita-ske.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored log output.
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the key manager's tick loop against a live exchange channel.
    Run(RunArgs),

    /// Configuration management.
    Config(ConfigCommand),

    /// Show a point-in-time summary of the configured route set.
    Status(StatusArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Audit log events allowed per second, per event kind.
    #[arg(long, default_value = "20")]
    pub audit_rate: u32,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file without starting the manager.
    Validate,
    /// Print the loaded configuration (with env overrides applied).
    Show,
    /// Write an example configuration to the given path.
    Generate {
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args)]
pub struct StatusArgs {
    /// Print as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

pub struct CliApp;

impl CliApp {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let cli = Cli::parse();
        logging::init(&LoggingConfig {
            level: cli.global.log_level.clone(),
            enable_colors: !cli.global.no_color,
        });

        match cli.command {
            Commands::Run(args) => self.handle_run(&cli.global.config, args).await,
            Commands::Config(args) => self.handle_config(&cli.global.config, args),
            Commands::Status(args) => self.handle_status(&cli.global.config, args),
            Commands::Completions(args) => self.handle_completions(args),
        }
    }

    fn load_config(&self, path: &PathBuf) -> Result<ManagerConfig, Box<dyn std::error::Error + Send + Sync>> {
        ConfigManager::new(path.clone()).load().map_err(|e| e.into())
    }

    async fn handle_run(&mut self, config_path: &PathBuf, args: RunArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let config = self.load_config(config_path)?;
        info!(routes = config.routes.len(), "starting vita-ske key manager");

        let counters = Arc::new(Counters::new());
        let audit = Arc::new(AuditLog::new(args.audit_rate));
        let mut manager = KeyManager::new(&config, counters, audit, Instant::now());

        let bind_addr = SocketAddr::new(config.node_address.into(), EXCHANGE_PORT);
        let socket = UdpSocket::bind(bind_addr).await?;
        info!(%bind_addr, "exchange channel bound");

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let mut recv_buf = [0u8; 256];
        let start = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let mut inbound = Vec::new();
                    while let Ok(Ok((len, _from))) = tokio::time::timeout(Duration::from_millis(0), socket.recv_from(&mut recv_buf)).await {
                        inbound.push(recv_buf[..len].to_vec());
                    }
                    let now = Instant::now();
                    match manager.tick(now, inbound) {
                        Ok(output) => {
                            for datagram in output.outbound {
                                let dest = SocketAddr::new(std::net::IpAddr::V4(datagram.gateway), EXCHANGE_PORT);
                                if let Err(e) = socket.send_to(&datagram.bytes, dest).await {
                                    warn!(route = %datagram.route, error = %e, "failed to send exchange datagram");
                                }
                            }
                        }
                        Err(fatal) => {
                            error!(error = %fatal, "fatal key manager condition, aborting");
                            return Err(Box::new(fatal));
                        }
                    }
                }
            }
        }

        info!(uptime_secs = start.elapsed().as_secs(), routes = manager.route_count(), "shut down cleanly");
        Ok(())
    }

    fn handle_config(&self, config_path: &PathBuf, cmd: ConfigCommand) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match cmd.action {
            ConfigAction::Validate => {
                self.load_config(config_path)?;
                println!("configuration is valid");
                Ok(())
            }
            ConfigAction::Show => {
                let config = self.load_config(config_path)?;
                println!("{}", serde_yaml::to_string(&config)?);
                Ok(())
            }
            ConfigAction::Generate { output } => {
                let example = ManagerConfig {
                    node_address: Ipv4Addr::new(10, 0, 0, 1),
                    sadb_path: PathBuf::from("/var/run/vita-ske/sadb.json"),
                    routes: vec![crate::config::RouteConfig {
                        id: "example".to_string(),
                        gateway: Ipv4Addr::new(10, 0, 0, 2),
                        psk: [0u8; 32],
                        route_spi: 1,
                    }],
                    ..Default::default()
                };
                std::fs::write(&output, serde_yaml::to_string(&example)?)?;
                println!("wrote example configuration to {}", output.display());
                Ok(())
            }
        }
    }

    fn handle_status(&self, config_path: &PathBuf, args: StatusArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let config = self.load_config(config_path)?;
        if args.json {
            let summary = serde_json::json!({
                "routes": config.routes.len(),
                "negotiation_ttl_secs": config.negotiation_ttl.as_secs_f64(),
                "sa_ttl_secs": config.sa_ttl.as_secs_f64(),
                "sadb_path": config.sadb_path,
            });
            println!("{summary}");
        } else {
            println!("configured routes: {}", config.routes.len());
            println!("negotiation_ttl: {:?}", config.negotiation_ttl);
            println!("sa_ttl: {:?}", config.sa_ttl);
            println!("sadb_path: {}", config.sadb_path.display());
        }
        Ok(())
    }

    fn handle_completions(&self, args: CompletionsArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use clap::CommandFactory;
        use clap_complete::generate;

        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(args.shell, &mut cmd, name, &mut std::io::stdout());
        Ok(())
    }
}

impl Default for CliApp {
    fn default() -> Self {
        Self::new()
    }
}
