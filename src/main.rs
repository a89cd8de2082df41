//! SaaS MCP Bridge - multi-tenant MCP routing for SaaS adapter services
//!
//! Serves the built-in tools over streamable HTTP and the legacy SSE transport.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use saas_mcp_bridge::{
    cli::{Cli, Command},
    config::Config,
    registry::ToolRegistry,
    server::AdapterServer,
    setup_tracing,
    tools::register_builtin_tools,
    upstream::{HttpUpstreamFactory, UpstreamFactory},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Tools) => run_tools(),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn build_registry() -> saas_mcp_bridge::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry)?;
    Ok(registry)
}

/// Print tool descriptors as JSON
fn run_tools() -> ExitCode {
    let registry = match build_registry() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Failed to build tool registry: {e}");
            return ExitCode::FAILURE;
        }
    };

    let tools: Vec<_> = registry.list_tools().map(|d| d.to_tool()).collect();
    match serde_json::to_string_pretty(&tools) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize tools: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        default_credentials = config.credentials.default_token.is_some(),
        upstream = config.upstream.base_url.as_deref().unwrap_or("<unset>"),
        "Starting SaaS MCP Bridge"
    );

    let factory: Arc<dyn UpstreamFactory> =
        match HttpUpstreamFactory::new(&config.upstream, &config.credentials) {
            Ok(factory) => Arc::new(factory),
            Err(e) => {
                error!("Failed to create upstream client factory: {e}");
                return ExitCode::FAILURE;
            }
        };

    let server = match build_registry()
        .and_then(|registry| AdapterServer::new(config, registry, Some(factory)))
    {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
