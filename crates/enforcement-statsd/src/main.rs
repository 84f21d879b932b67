//! Enforcement stats daemon
//!
//! Connects to the switch control channel, installs the table's default
//! flow, serves the control API and runs the poll/aggregate/report loop
//! until SIGINT. Lost switch connections are re-established with backoff.

use anyhow::Context;
use clap::Parser;
use enforcement_statsd::api::{self, ApiState};
use enforcement_statsd::collaborators::{MappingStore, RestartInfoStore, SessionStateReporter};
use enforcement_statsd::constants::MSG_CHANNEL_TIMEOUT;
use enforcement_statsd::controller::event_channel;
use enforcement_statsd::msg_hub::MessageHub;
use enforcement_statsd::restart::{process_pid, was_restarted};
use enforcement_statsd::{
    Backoff, ControllerDeps, DatapathSlot, DatapathSupervisor, EnforcementConfig,
    EnforcementStatsController, HttpSessiondClient, PrefixMapper, RedisStore, RuleIdMapper,
    SWITCH_DAEMON_KEY,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const PRINT_PAYLOAD_ENV: &str = "MAGMA_PRINT_GRPC_PAYLOAD";

/// Policy usage metering daemon
#[derive(Parser, Debug)]
#[command(name = "enforcement-statsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = enforcement_statsd::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Poll interval in seconds, overrides the configuration file
    #[arg(long)]
    poll_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("enforcement-statsd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("enforcement-statsd: Starting");
    match run(args).await {
        Ok(()) => {
            info!("enforcement-statsd: Exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "enforcement-statsd: Exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level).context("invalid log level")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

async fn switch_restarted(store: &dyn RestartInfoStore) -> bool {
    let pid = process_pid(SWITCH_DAEMON_KEY).await;
    match was_restarted(store, SWITCH_DAEMON_KEY, pid).await {
        Ok(restarted) => restarted,
        Err(e) => {
            // without the marker, assume counters were reset
            warn!(error = %e, "Restart marker unavailable, requesting rule version resync");
            true
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = EnforcementConfig::load_or_default(&args.config)?;
    if let Some(secs) = args.poll_interval {
        config.enforcement.poll_interval_secs = secs;
    }
    if env_flag(PRINT_PAYLOAD_ENV) {
        config.print_grpc_payload = true;
    }
    config.validate()?;
    info!(
        bridge = %config.bridge_name,
        table = config.enforcement.table_number,
        poll_interval_secs = config.enforcement.poll_interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(
        RedisStore::connect(&config.redis_url())
            .await
            .context("connecting to redis")?,
    );
    let restarted = switch_restarted(store.as_ref()).await;

    let mappings: Arc<dyn MappingStore> = store.clone();
    let rule_mapper = Arc::new(
        RuleIdMapper::load(mappings.clone())
            .await
            .context("loading rule number mappings")?,
    );
    let prefixes = Arc::new(
        PrefixMapper::load(mappings)
            .await
            .context("loading IPv6 prefix mappings")?,
    );

    let hub = Arc::new(MessageHub::new(MSG_CHANNEL_TIMEOUT));
    let events = event_channel();
    let slot = Arc::new(DatapathSlot::new());
    let mut supervisor = DatapathSupervisor::new(
        config.datapath.address.clone(),
        slot.clone(),
        hub.clone(),
        events.0.clone(),
        Backoff::new(config.reconnect_initial(), config.reconnect_max()),
    );
    let datapath = supervisor
        .connect()
        .await
        .with_context(|| format!("connecting to datapath {}", config.datapath.address))?;

    let api_listener = if config.api.enabled {
        let addr = config.api_listen_addr()?;
        Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding control API on {}", addr))?,
        )
    } else {
        None
    };

    let sessiond = Arc::new(HttpSessiondClient::new(&config.sessiond.url)?);
    let session_reporter: Option<Arc<dyn SessionStateReporter>> = if config.enable5g_features {
        Some(sessiond.clone())
    } else {
        None
    };

    let deps = ControllerDeps {
        datapath: slot,
        hub,
        reporter: sessiond,
        session_reporter,
        versions: store,
        rule_mapper,
        prefixes: prefixes.clone(),
    };
    let mut controller = EnforcementStatsController::new(config, deps, events, restarted);
    controller
        .initialize_on_connect()
        .await
        .context("installing default flows")?;

    let handle = controller.handle();
    let scheduler = controller.spawn_scheduler();
    let main_loop = tokio::spawn(controller.run());
    let reconnects = tokio::spawn(supervisor.run(datapath));

    let shutdown = CancellationToken::new();
    let api_server = api_listener.map(|listener| {
        let stop = shutdown.clone();
        let state = ApiState::new(handle.clone(), prefixes);
        tokio::spawn(async move {
            if let Err(e) = api::serve(listener, state, async move { stop.cancelled().await }).await {
                error!(error = %e, "Control API stopped");
            }
        })
    });

    handle.finish_init();
    info!("enforcement-statsd: Running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("enforcement-statsd: Received shutdown signal");

    shutdown.cancel();
    if let Some(server) = api_server {
        if let Err(e) = server.await {
            warn!(error = %e, "Control API task failed");
        }
    }
    handle.shutdown();
    main_loop.await.context("controller task failed")?;
    reconnects.abort();
    scheduler.abort();
    Ok(())
}
