//! Command-line interface

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

/// Sheet Gateway - rate-limited, cached spreadsheet API proxy
#[derive(Parser, Debug)]
#[command(name = "sheet-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SHEET_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SHEET_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SHEET_GATEWAY_HOST", global = true)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SHEET_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SHEET_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Call the upstream once and print the result as JSON
    #[command(group(ArgGroup::new("target").required(true).args(["list", "sheet"])))]
    Fetch {
        /// List sheet titles
        #[arg(long)]
        list: bool,

        /// Sheet to fetch
        #[arg(long)]
        sheet: Option<String>,
    },

    /// Serve the web app through the offline cache controller
    Edge {
        /// Origin the edge host fronts (overrides `worker.origin`)
        #[arg(long)]
        origin: Option<String>,

        /// Port to listen on (overrides `worker.edge_port`)
        #[arg(long)]
        port: Option<u16>,
    },
}
