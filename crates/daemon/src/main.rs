/// Lurker Daemon - reverse connection handshake node
///
/// This daemon:
/// - Listens for handshakes on TCP, UDP and the hole punching port
/// - Dials every newly discovered peer back, once per identity
/// - Optionally reaches out to a target given on the command line

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};

use lurker_common::{Addr, LurkerConfig, Service};
use lurker_core::{Lurker, PeerRegistry, PeerSource, RegistryStats, Source};

const DEFAULT_CONFIG: &str = "lurker.toml";

/// How long the daemon stays up without a shutdown signal
const KEEP_ALIVE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    id: Option<String>,
    target: Option<String>,
    verbose: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(Args),
    Help,
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let mut parsed = Args::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "help" | "--help" | "-h" => return Ok(Command::Help),
            "version" | "--version" | "-V" => return Ok(Command::Version),
            "--verbose" | "-v" => parsed.verbose = true,
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--id" => {
                parsed.id = Some(args.next().context("--id needs a value")?);
            }
            flag if flag.starts_with('-') => bail!("Unknown option: {}", flag),
            target => {
                if parsed.target.is_some() {
                    bail!("Only one target may be given, got {}", target);
                }
                parsed.target = Some(target.to_string());
            }
        }
    }

    Ok(Command::Run(parsed))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("Lurker Daemon v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    };

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let loaded = config_path.exists();
    let config = if loaded {
        LurkerConfig::from_file(&config_path)?
    } else {
        LurkerConfig::default()
    };

    // Initialize logging
    let level = if config.verbose || args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Lurker Daemon v{}", env!("CARGO_PKG_VERSION"));

    if loaded {
        info!("Loaded configuration from {:?}", config_path);
    } else {
        info!("No configuration file found, using defaults");
        if let Err(e) = config.to_file(&config_path) {
            warn!("Failed to save default config: {}", e);
        } else {
            info!("Saved default configuration to {:?}", config_path);
        }
    }

    run(config, args).await
}

async fn run(config: LurkerConfig, args: Args) -> Result<()> {
    let id = args.id.unwrap_or_else(random_id);

    let mut lurker = Lurker::bind(config).context("Failed to bind listening ports")?;

    let local = match lurker.local_service(id.clone()) {
        Ok(service) => service,
        Err(e) => {
            warn!("Internal address discovery failed: {}", e);
            Service::new(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST)).with_ports(
                lurker.port_tcp(),
                lurker.port_udp(),
                lurker.port_hole(),
            )
        }
    };
    let local = Arc::new(local);

    info!(
        "Local service {} at {} (tcp {}, udp {}, hole {})",
        local.id, local.isp, local.port_tcp, local.port_udp, local.port_hole
    );

    let sources = lurker.listen(local.as_ref().clone())?;

    let registry: Arc<PeerRegistry<PeerSource>> = Arc::new(PeerRegistry::new());
    tokio::spawn(Arc::clone(&registry).run(sources));

    if let Some(target) = args.target {
        let (addr, qualifier) = Addr::parse(&target)?;
        if let Some(qualifier) = qualifier {
            debug!("Ignoring qualifier {:?} on {}", qualifier, addr);
        }

        let source = lurker.source_to(addr, Arc::clone(&local));
        tokio::spawn(async move {
            info!("Connecting to {}", addr);
            match source.try_connect().await.into_result() {
                Ok(reachability) => info!("Connected to {} ({})", addr, reachability),
                Err(e) => warn!("Could not reach {}: {}", addr, e),
            }
        });
    }

    info!("Lurker is running. Press Ctrl+C to stop.");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
        _ = tokio::time::sleep(KEEP_ALIVE) => {
            info!("Keep-alive period elapsed");
        }
    }

    print_registry_stats(&id, &registry.stats().await);

    lurker.stop().await;
    Ok(())
}

/// 16 hex characters
fn random_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Print registry statistics
fn print_registry_stats(id: &str, stats: &RegistryStats) {
    println!("\n========================================");
    println!("         Lurker Status");
    println!("========================================");
    println!("Lurker ID:        {}", id);
    println!("Peers:            {}", stats.total_peers);
    println!("Connecting:       {}", stats.connecting);
    println!("Connected:        {}", stats.connected);
    println!("Failed:           {}", stats.failed);
    println!("========================================\n");
}

/// Print help message
fn print_help() {
    println!("Lurker Daemon - reverse connection handshake node");
    println!();
    println!("USAGE:");
    println!("    lurker-daemon [OPTIONS] [TARGET]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>   Configuration file (default: lurker.toml)");
    println!("        --id <ID>         Local identity (default: random)");
    println!("    -v, --verbose         Debug logging");
    println!("    help                  Show this help message");
    println!("    version               Show version information");
    println!();
    println!("TARGET:");
    println!("    [tcp://|udp://]ip[:port][/qualifier]");
    println!();
    println!("EXAMPLES:");
    println!("    # Wait for peers on the default ports (16004/16005/16006)");
    println!("    lurker-daemon");
    println!();
    println!("    # Reach out to a peer");
    println!("    lurker-daemon 203.0.113.7:16004");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(parse(&[]).unwrap(), Command::Run(Args::default()));
    }

    #[test]
    fn test_parse_full() {
        let command = parse(&["--config", "a.toml", "--id", "abc", "-v", "10.0.0.1:16004"]).unwrap();
        assert_eq!(
            command,
            Command::Run(Args {
                config: Some(PathBuf::from("a.toml")),
                id: Some("abc".to_string()),
                target: Some("10.0.0.1:16004".to_string()),
                verbose: true,
            })
        );
    }

    #[test]
    fn test_parse_help_and_errors() {
        assert_eq!(parse(&["help"]).unwrap(), Command::Help);
        assert_eq!(parse(&["--version"]).unwrap(), Command::Version);
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["1.1.1.1", "2.2.2.2"]).is_err());
    }

    #[test]
    fn test_random_id() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
