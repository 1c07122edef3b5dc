use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod check;
mod config;
mod logging;
mod server;

use check::Reflector;
use logging::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "reflector", version, about = "Tells callers which of their TCP ports are reachable from outside")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./reflector.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run the HTTP service
    Serve {
        /// Listening port (overrides config and REFLECTOR_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Diagnostic log format
        #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
        log_format: LogFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("reflector {} (core {})", env!("CARGO_PKG_VERSION"), reflector_core::version());
        }
        Commands::Serve { port, log_format } => {
            logging::init(log_format);
            let mut settings = config::load_settings(cli.config.as_deref())?;
            if let Some(p) = port {
                settings.listen_port = p;
            }
            info!(
                allowed_ports = ?settings.allowed_ports,
                rate_limit_per_min = settings.rate_limit_per_min,
                timeout_ms = settings.timeout.as_millis() as u64,
                "starting reflector"
            );
            let addr = SocketAddr::from(([0, 0, 0, 0], settings.listen_port));
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                let sink = reflector_core::accesslog::open_access_sink(&settings.log_dir);
                let service = Arc::new(Reflector::new(settings, sink));
                let _maintenance = service.spawn_maintenance();
                server::serve(service, addr).await
            })?;
            info!("server stopped");
        }
    }
    Ok(())
}
