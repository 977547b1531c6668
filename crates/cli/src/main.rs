#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info};

use fleetwatch_funnel::{handler_fn, ChangeRecord, Funnel, FunnelConfig, NamespaceScope};

#[derive(Parser, Debug)]
#[command(name = "fleetwatch", version, about = "Multi-cluster resource change funnel")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the configured clusters and print every change
    Run {
        /// Path to the configuration file
        #[arg(long = "config", default_value = "./config.yaml")]
        config: String,
    },
    /// Parse and validate a configuration file
    Check {
        /// Path to the configuration file
        #[arg(long = "config", default_value = "./config.yaml")]
        config: String,
    },
}

fn init_tracing() {
    let env = std::env::var("FLEETWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLEETWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FLEETWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            info!(config = %config, "run invoked");
            let config = FunnelConfig::from_yaml_file(&config)?;
            let funnel = Arc::new(Funnel::new(config).await.context("building funnel")?);

            match cli.output {
                Output::Human => {
                    funnel.add_event_handler(handler_fn(|record: ChangeRecord| async move {
                        println!(
                            "{:<20} {:<13} {:<7} {}",
                            record.cluster, record.kind, record.event, record.key
                        );
                        Ok(())
                    }));
                }
                Output::Json => {
                    funnel.add_event_handler(handler_fn(|record: ChangeRecord| async move {
                        println!("{}", serde_json::to_string(&record)?);
                        Ok(())
                    }));
                }
            }

            let runner = tokio::spawn({
                let funnel = Arc::clone(&funnel);
                async move { funnel.run().await }
            });

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down");
            funnel.stop();
            if let Err(e) = runner.await? {
                error!(error = %e, "funnel run failed");
            }
        }
        Commands::Check { config: path } => {
            let config = FunnelConfig::from_yaml_file(&path)?;
            match cli.output {
                Output::Human => {
                    println!(
                        "{}: ok ({} clusters, max requeue {})",
                        path,
                        config.clusters.len(),
                        config.max_requeue
                    );
                    for cluster in &config.clusters {
                        for watch in &cluster.list {
                            let ns = match &watch.namespace {
                                NamespaceScope::All => "all namespaces",
                                NamespaceScope::Namespace(ns) => ns.as_str(),
                            };
                            println!("  {} • {} • {}", cluster.cluster_name, watch.r_type, ns);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        }
    }

    Ok(())
}
