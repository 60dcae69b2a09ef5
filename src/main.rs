use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clamgate::{
    clamd::{Clamd, ClamdBroker, Coordinator},
    config::Config,
    error::{Error, Result},
    server,
};

#[derive(Debug)]
struct Args {
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Load configuration
    let config = if let Some(config_path) = &args.config_path {
        Config::load(config_path).await?
    } else {
        Config::load_from_default_locations().await?
    };

    // CLI log level wins over the config file
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(log_level)?;

    info!("Starting clamgate v{}", env!("CARGO_PKG_VERSION"));

    if args.dry_run {
        info!("Configuration is valid. Dry run complete.");
        return Ok(());
    }

    // Static backend list: one clamd per configuration in this design
    let backend = Clamd::new(config.clamd.address()?).with_opts(config.clamd.connect_opts());

    // Probe the backend before committing a worker pool to it
    info!(address = %backend.address(), "Testing clamd connection...");
    match backend.ping().await {
        Ok(pong) if pong == "PONG" => info!("clamd connection successful"),
        Ok(other) => {
            error!(reply = %other, "Unexpected ping reply from clamd");
            return Err(Error::Protocol(format!("unexpected ping reply: {}", other)));
        }
        Err(err) => {
            error!(error = %err, "Failed to connect to clamd");
            return Err(err);
        }
    }

    match backend.version().await {
        Ok(version) => info!(version = %version, "clamd version"),
        Err(err) => warn!(error = %err, "Could not get clamd version"),
    }

    let coordinator = Arc::new(Coordinator::init(
        vec![backend],
        config
            .clamd
            .coordinator_opts(config.shutdown_timeout()),
        config.clamd.session_opts(),
    )?);

    let router = server::router(
        Arc::clone(&coordinator) as Arc<dyn ClamdBroker>,
        config.cors.enabled,
    );

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .map_err(|e| Error::Config(format!("unable to bind {}: {}", bind_address, e)))?;

    info!(address = %bind_address, "Server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    // Drain the worker pool once the server has stopped accepting
    info!("Shutting down...");
    coordinator.shutdown().await;

    info!("clamgate shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!(error = %err, "Unable to listen for shutdown signal"),
    }
}

fn parse_args() -> Args {
    let matches = Command::new("clamgate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("clamgate - HTTP facade for clamd antivirus scanning")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .num_args(1),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .num_args(1),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    Args {
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        log_level: matches.get_one::<String>("log-level").cloned(),
        dry_run: matches.get_flag("dry-run"),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => return Err(Error::Config(format!("Invalid log level: {}", log_level))),
    };

    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("clamgate={}", level).parse().unwrap())
        .add_directive(format!("tower_http={}", level).parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .init();

    Ok(())
}
