//! Sheet Gateway - rate-limited, cached spreadsheet API proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use sheet_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
    upstream::{SheetSource, SheetsClient},
    worker::edge::EdgeHost,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    match cli.command {
        Some(Command::Fetch { list, sheet }) => run_fetch(&config, list, sheet.as_deref()).await,
        Some(Command::Edge { origin, port }) => {
            if let Some(origin) = origin {
                config.worker.origin = origin;
            }
            if let Some(port) = port {
                config.worker.edge_port = port;
            }
            run_edge(config).await
        }
        Some(Command::Serve) | None => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            run_server(config).await
        }
    }
}

/// Call the upstream once and print the JSON result
async fn run_fetch(config: &Config, list: bool, sheet: Option<&str>) -> ExitCode {
    let client = match SheetsClient::new(&config.upstream) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to create upstream client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match (list, sheet) {
        (true, _) | (false, None) => client
            .fetch_list()
            .await
            .map(|sheets| serde_json::json!({ "sheets": sheets })),
        (false, Some(name)) => client
            .fetch_values(name)
            .await
            .map(|data| serde_json::json!({ "values": data.values, "range": data.range })),
    };

    match result.and_then(|value| serde_json::to_string_pretty(&value).map_err(Into::into)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fetch failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_edge(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        origin = %config.worker.origin,
        port = config.worker.edge_port,
        "Starting edge host"
    );

    let host = match EdgeHost::new(config) {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to create edge host: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = host.run().await {
        error!("Edge host error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Edge host shutdown complete");
    ExitCode::SUCCESS
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting Sheet Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
