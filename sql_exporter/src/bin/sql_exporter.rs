use std::{env, path::Path, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use sql_exporter::{
    config::{self, Config},
    exposition,
    gauge::GaugeStore,
    runner::{self, QueryRunner},
    scheduler::{self, Scheduler},
    source::{self, SqlSource},
};
use tokio::{runtime::Builder, signal};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const CONFIG_ENV: &str = "SQL_EXPORTER_CONFIG";
const CONNECT_STRING_ENV: &str = "SQL_EXPORTER_CONNECT_STRING";

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Data source error: {0}")]
    Source(#[from] source::Error),
    #[error("Query runner error: {0}")]
    Runner(#[from] runner::Error),
    #[error("Scheduler stopped: {0}")]
    Scheduler(#[from] scheduler::Error),
    #[error("Exposition endpoint error: {0}")]
    Exposition(#[from] exposition::Error),
    #[error("Failed to install telemetry recorder: {0}")]
    Recorder(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Could not join the exposition task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("No connect string given in arguments, SQL_EXPORTER_CONNECT_STRING or config")]
    MissingConnectString,
}

fn default_config_path() -> String {
    "/etc/sql_exporter/sql_exporter.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct CliWithSubcommands {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the exporter with specified configuration
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file or directory
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// port to expose metrics on, overrides the configured binding address
    #[clap(short, long)]
    port: Option<u16>,
    /// data source connection URL, overrides environment and configuration
    #[clap(short = 's', long)]
    connect_string: Option<String>,
    /// log at debug level when RUST_LOG is not set
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file or directory
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .finish()
        .init();
}

/// Load the configuration, preferring the contents of `SQL_EXPORTER_CONFIG`
/// over `config_path`.
fn get_config(config_path: &str, from_env: Option<String>) -> Result<Config, Error> {
    let config = if let Some(contents) = from_env {
        debug!("Using config from env var '{CONFIG_ENV}'");
        Config::from_yaml(&contents)
    } else {
        debug!("Attempting to load configuration at: {config_path}");
        config::load_config_from_path(Path::new(config_path))
    };
    config.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

/// Pick the connect string: command line, then environment, then config.
fn resolve_connect_string(
    cli: Option<String>,
    from_env: Option<String>,
    config: Option<String>,
) -> Result<String, Error> {
    cli.or(from_env)
        .or(config)
        .ok_or(Error::MissingConnectString)
}

async fn inner_main(
    config: Config,
    connect_string: String,
    interrupt: sql_exporter_signal::Watcher,
) -> Result<(), Error> {
    let recorder = PrometheusBuilder::new().install_recorder()?;
    let store = Arc::new(GaugeStore::new());

    let (server_watcher, server_broadcast) = sql_exporter_signal::signal();
    let server = exposition::Server::bind(
        config.exposition,
        Arc::clone(&store),
        Some(recorder),
        server_watcher,
    )
    .await?;
    let server_handle = tokio::spawn(server.run());

    let mut scheduler = Scheduler::new(interrupt);
    for query in config.queries {
        let source = SqlSource::connect(&connect_string).await?;
        let runner = QueryRunner::new(query, source, Arc::clone(&store))?;
        scheduler.schedule(runner.interval(), Box::new(runner));
    }
    info!("running {} queries", scheduler.len());

    let res = scheduler.run().await;

    server_broadcast.signal();
    server_handle.await??;
    res.map_err(Error::from)
}

fn main() -> Result<(), Error> {
    let cli = CliWithSubcommands::parse();
    let args = match cli.command {
        Commands::ConfigCheck(config_check_cmd) => {
            init_tracing(false);
            match get_config(&config_check_cmd.config_path, env::var(CONFIG_ENV).ok()) {
                Ok(_) => {
                    info!("Configuration file is valid");
                    std::process::exit(0)
                }
                Err(_) => std::process::exit(1),
            }
        }
        Commands::Run(run_cmd) => run_cmd,
    };
    init_tracing(args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting sql_exporter {version}.");

    let mut config = get_config(&args.config_path, env::var(CONFIG_ENV).ok())?;
    if let Some(port) = args.port {
        config.exposition.binding_addr.set_port(port);
    }
    let connect_string = resolve_connect_string(
        args.connect_string,
        env::var(CONNECT_STRING_ENV).ok(),
        config.connect_string.take(),
    )?;

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(async {
        let (interrupt_watcher, interrupt_broadcast) = sql_exporter_signal::signal();
        let ctrl_c = tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("received ctrl-c");
                    interrupt_broadcast.signal();
                }
                Err(err) => {
                    error!("Unable to listen for ctrl-c: {err}");
                    // Dropping the broadcaster would stop the exporter.
                    std::future::pending::<()>().await;
                }
            }
        });
        let res = inner_main(config, connect_string, interrupt_watcher).await;
        ctrl_c.abort();
        res
    });
    runtime.shutdown_timeout(Duration::from_secs(5));
    info!("Bye. :)");
    res
}
