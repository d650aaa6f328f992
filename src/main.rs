//! flatlink - FlatKV RPC over a single connection
//!
//! Serve methods, call a remote method, or encode/decode FlatKV tokens.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flatlink::config::{self, Config};
use flatlink::network::{connect_host, Server};
use flatlink::protocol::{decode_frame, encode_frame, Frame};
use flatlink::transport::{CallOptions, Coordinator, EchoHandler, TransportError};

/// flatlink - request/response RPC over one connection
#[derive(Parser)]
#[command(name = "flatlink")]
#[command(version)]
#[command(about = "Correlated RPC over a single connection using FlatKV frames", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for a peer and serve the built-in methods
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Call a method on a serving peer
    Call {
        /// Server host name or address
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Response timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Method name
        method: String,

        /// Arguments as key=value
        args: Vec<String>,
    },

    /// Encode key=value pairs as a FlatKV token
    Encode {
        /// Pairs as key=value
        pairs: Vec<String>,
    },

    /// Decode a FlatKV token and print it as JSON
    Decode {
        /// The encoded token
        token: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_else(|e| {
            tracing::warn!("Ignoring config: {}", e);
            Config::default()
        })
    };

    match cli.command {
        Commands::Serve { port, bind } => {
            run_server(config, port, bind).await?;
        }
        Commands::Call {
            server,
            port,
            timeout_ms,
            method,
            args,
        } => {
            run_call(config, &server, port, timeout_ms, &method, &args).await?;
        }
        Commands::Encode { pairs } => {
            let frame = parse_pairs(&pairs)?;
            println!("{}", encode_frame(&frame));
        }
        Commands::Decode { token } => {
            let frame = decode_frame(&token)?;
            println!("{}", serde_json::to_string_pretty(&frame)?);
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Turn `key=value` arguments into a frame
fn parse_pairs(pairs: &[String]) -> anyhow::Result<Frame> {
    let parsed = pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .with_context(|| format!("expected key=value, got {:?}", pair))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Frame::from_pairs(parsed)?)
}

/// Serve until Ctrl+C
async fn run_server(mut config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }

    let coordinator = Coordinator::new(config.transport_config());
    coordinator.register_handler("ping", EchoHandler);
    coordinator.register_fn("time", |_args| async {
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
        let millis = now.as_millis().to_string();
        Ok::<_, anyhow::Error>(Frame::from_pairs([("unix_ms", millis.as_str())])?)
    });

    let mut server = Server::new(config.network_config(), coordinator.clone());
    let local_addr = server.start().await?;
    let liveness = coordinator.start_liveness();

    println!("\n========================================");
    println!("  flatlink Server Running");
    println!("========================================");
    println!("  Address: {}", local_addr);
    println!("  Methods: ping, time");
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
        _ = coordinator.closed() => {}
    }

    server.stop().await?;
    coordinator.close();
    if let Some(liveness) = liveness {
        let _ = liveness.await;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Connect, make one call, print the result as JSON
async fn run_call(
    config: Config,
    server: &str,
    port: Option<u16>,
    timeout_ms: Option<u64>,
    method: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let args = parse_pairs(args)?;
    let mut network = config.network_config();
    if let Some(port) = port {
        network.port = port;
    }

    let coordinator = Coordinator::new(config.transport_config().without_liveness());
    let pump = connect_host(server, &coordinator, &network)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", server, network.port))?;

    let mut options = coordinator.default_call_options();
    if let Some(timeout_ms) = timeout_ms {
        options = CallOptions::new(Duration::from_millis(timeout_ms), options.connect_timeout);
    }

    let result = coordinator.call(method, args, options).await;
    coordinator.close();
    let _ = pump.await;

    match result {
        Ok(fields) => {
            println!("{}", serde_json::to_string_pretty(&fields)?);
            Ok(())
        }
        Err(TransportError::PeerReported { message, frame, .. }) => {
            tracing::debug!("Error response: {}", encode_frame(&frame));
            anyhow::bail!("{} failed on peer: {}", method, message)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["flatlink", "call", "ping", "text=hi"]).unwrap();
        match cli.command {
            Commands::Call { method, args, server, .. } => {
                assert_eq!(method, "ping");
                assert_eq!(args, vec!["text=hi".to_string()]);
                assert_eq!(server, "127.0.0.1");
            }
            _ => panic!("expected call"),
        }

        assert!(Cli::try_parse_from(["flatlink", "serve", "--port", "0"]).is_ok());
        assert!(Cli::try_parse_from(["flatlink", "decode"]).is_err());
    }

    #[test]
    fn test_parse_pairs() {
        let frame = parse_pairs(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(frame.get("a"), Some("1"));
        assert_eq!(frame.get("b"), Some("x=y"));

        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["bad key=1".to_string()]).is_err());
    }
}
