//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Versioned route manager, queue fabric, and hook orchestrator HTTP edge.
#[derive(Parser, Debug)]
#[command(name = "routeforge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "ROUTEFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "ROUTEFORGE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "ROUTEFORGE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ROUTEFORGE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "ROUTEFORGE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
