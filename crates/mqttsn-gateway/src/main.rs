// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN Gateway CLI
//!
//! Bridges MQTT-SN devices on UDP to an MQTT 3.1 broker.
//!
//! # Usage
//!
//! ```bash
//! # Run with gateway.toml from the current directory
//! mqttsn-gateway
//!
//! # Explicit configuration and verbose logging
//! mqttsn-gateway --config /etc/mqttsn/gateway.toml --log-level debug
//!
//! # Write a default configuration file
//! mqttsn-gateway gen-config --output gateway.toml
//!
//! # Check a configuration file
//! mqttsn-gateway validate --config gateway.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mqttsn_gateway::{
    ControlKind, Dispatcher, Envelope, GatewayConfig, MessageQueue, SocketLinkFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mqttsn-gateway")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MQTT-SN to MQTT gateway for sensor networks")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(cmd) = cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"));
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = GatewayConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    tracing::info!(
        gw_id = config.gw_id,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        device_links = config.device_links.len(),
        "Starting MQTT-SN gateway"
    );

    let queue = Arc::new(MessageQueue::new());
    let links = Arc::new(SocketLinkFactory::new(&config, Arc::clone(&queue)));
    let mut dispatcher =
        Dispatcher::new(config, links, Arc::clone(&queue)).context("Invalid configuration")?;

    ctrlc_handler(Arc::clone(&queue));

    dispatcher.run().context("Gateway stopped")?;
    tracing::info!("Gateway shutdown complete");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let config = GatewayConfig::default();
    let toml_str = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    let content = format!(
        r#"# MQTT-SN Gateway Configuration
# Generated by mqttsn-gateway gen-config
#
# Periods are in seconds. Predefined topics are declared as:
#
# [[predefined_topics]]
# id = 1
# name = "sys/clock"

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<()> {
    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("Configuration invalid: {}", config_path.display()))?;

    println!("Configuration valid!");
    println!();
    println!("Gateway id: {}", config.gw_id);
    println!("Broker:     {}:{}", config.broker.host, config.broker.port);
    println!("Predefined: {} topic(s)", config.predefined_topics.len());
    for link in &config.device_links {
        println!("  link {}", link.name());
    }
    Ok(())
}

/// Setup Ctrl+C handler.
fn ctrlc_handler(queue: Arc<MessageQueue>) {
    let _ = ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, shutting down...");
        queue.put(Envelope::broadcast(ControlKind::ShutDown));
    });
}
