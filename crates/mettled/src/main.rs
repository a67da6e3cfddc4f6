//! mettled - pluggable telemetry agent.
//!
//! Reads a JSON configuration naming collectors and handlers, runs the
//! pipeline between them and serves its own statistics over HTTP.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod status;

use std::net::SocketAddr;
use std::process;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use mettle_core::agent::Agent;
use mettle_core::config::AgentConfig;

/// Pluggable telemetry agent.
#[derive(Parser, Debug)]
#[command(name = "mettled", about = "Pluggable telemetry agent", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "METTLE_CONFIG", default_value = "/etc/mettle/mettle.json")]
    config: String,

    /// Overrides `internalServer.port` from the configuration.
    #[arg(long)]
    status_port: Option<u16>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initializes the tracing subscriber. RUST_LOG directives are honoured for
/// everything outside the agent's own crates.
fn init_logging(verbose: u8, quiet: bool) {
    let level = log_level(verbose, quiet);
    let mut filter = EnvFilter::from_default_env();
    for target in ["mettled", "mettle_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = match AgentConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config, error = %e, "cannot load configuration");
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args, config)) {
        error!(error = %e, "agent stopped");
        process::exit(1);
    }
}

async fn async_main(args: Args, config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = mettle_core::VERSION, config = %args.config, "starting mettled");

    let agent = Agent::start(&config).await?;
    info!(
        handlers = ?agent.handler_names(),
        collectors = ?agent.collector_names(),
        "agent running"
    );

    let port = args.status_port.unwrap_or(config.internal_server.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = status::router(agent.stats(), &config.internal_server.path);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, path = %config.internal_server.path, "status server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    });
    let result = server.await;

    agent.shutdown();
    info!("mettled stopped");
    result.map_err(Into::into)
}
