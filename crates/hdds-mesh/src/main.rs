// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Mesh Runtime CLI
//!
//! Runs a mesh runtime instance and manages its configuration file.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults
//! hdds-mesh --instance-id node-a
//!
//! # Using configuration file
//! hdds-mesh --config mesh.toml
//!
//! # Generate / check a configuration file
//! hdds-mesh gen-config --output mesh.toml
//! hdds-mesh validate --config mesh.toml
//! ```

use clap::{Parser, Subcommand};
use hdds_mesh::{MeshConfig, MeshRuntime, RouterStatsSnapshot};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// HDDS Mesh Runtime
#[derive(Parser, Debug)]
#[command(name = "hdds-mesh")]
#[command(about = "HDDS Mesh Runtime - RPC routing, arbitration and publications")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instance identifier (overrides the configuration file)
    #[arg(long)]
    instance_id: Option<String>,

    /// JSON store file for routing entries and subscriptions
    #[arg(long)]
    persistence: Option<PathBuf>,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "10")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "mesh.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;
    let runtime = MeshRuntime::builder(config).build()?;

    println!("HDDS Mesh Runtime v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Instance: {}", runtime.config().instance_id);
    match &runtime.config().persistence.path {
        Some(path) => println!("Persistence: {}", path.display()),
        None => println!("Persistence: in-memory"),
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    if args.stats_interval > 0 {
        let router = runtime.router().clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !router.is_running() {
                    break;
                }
                print_stats(&router.stats());
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    runtime.shutdown();

    println!("\nFinal Statistics:");
    print_stats(&runtime.router().stats());

    Ok(())
}

fn build_config(args: &Args) -> Result<MeshConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_file(path)?,
        None => MeshConfig::default(),
    };
    if let Some(id) = &args.instance_id {
        config = config.instance_id(id.clone());
    }
    if let Some(path) = &args.persistence {
        config = config.persistence_path(path.clone());
    }
    config.log_level = args.log_level.clone();
    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = MeshConfig::default()
        .instance_id("example-node")
        .persistence_path("/var/lib/hdds-mesh/state.json");
    let toml_str = config.to_toml()?;

    let content = format!(
        r#"# HDDS Mesh Configuration
# Generated by hdds-mesh gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match MeshConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Instance: {}", config.instance_id);
            println!(
                "Queue: {} KiB, reaper every {} ms",
                config.messaging.max_queue_size_kbytes, config.messaging.queue_reaper_interval_ms
            );
            println!(
                "Discovery: timeout {} ms, retry every {} ms",
                config.discovery.discovery_timeout_ms, config.discovery.discovery_retry_delay_ms
            );
            println!("Minimum publication period: {} ms", config.publication.min_period_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(stats: &RouterStatsSnapshot) {
    println!("--- Router Statistics ---");
    println!(
        "  {} msgs routed ({:.1} msg/s, {}), {} queued, {} dropped, {} errors, up {}s",
        stats.messages_routed,
        stats.messages_per_second(),
        format_bytes(stats.bytes_routed),
        stats.messages_queued,
        stats.messages_dropped,
        stats.transmit_errors,
        stats.uptime_secs
    );
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
