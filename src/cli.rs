//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// SaaS MCP Bridge - multi-tenant MCP routing for SaaS adapters
#[derive(Parser, Debug)]
#[command(name = "saas-mcp-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SAAS_MCP_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SAAS_MCP_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SAAS_MCP_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SAAS_MCP_BRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SAAS_MCP_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the bridge server (default)
    Serve,

    /// Print the registered tool descriptors as JSON and exit
    Tools,
}
