use clap::Parser;
use dedup_core::obs::{self, Metrics};
use dedup_core::run::{run_session, RunError, SessionOutcome};
use dedup_core::storage::{BlobStore, S3Store};
use dedup_core::util::config::{broker_config, BrokerEnv, Config};
use dedup_core::util::shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const BATCHMETRICS_WAIT_MAX: Duration = Duration::from_secs(60);

/// Content-addressed deduplicating archiver: drains an inbox bucket into a
/// digest-addressed archive bucket, driven by listings and upload
/// notifications.
#[derive(Parser, Debug)]
#[command(name = "minio-dedup", version)]
struct Args {
    /// Uploads bucket
    #[arg(long, default_value = "")]
    inbox: String,
    /// Archive bucket
    #[arg(long, default_value = "")]
    archive: String,
    /// Object store host
    #[arg(long, default_value = "")]
    host: String,
    /// Use https
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    secure: bool,
    /// Access key
    #[arg(long, default_value = "")]
    accesskey: String,
    /// Secret key
    #[arg(long, default_value = "")]
    secretkey: String,
    /// Bind the metrics server to this address
    #[arg(long, default_value = ":2112")]
    metrics: String,
    /// Log every store request
    #[arg(long, default_value_t = false)]
    trace: bool,
    /// Run in batch mode: list + transfer, then exit
    #[arg(long, default_value_t = false)]
    batch: bool,
    /// Delay exit after a batch run until one metrics scrape was observed
    #[arg(long, default_value_t = false)]
    batchmetrics: bool,
    /// Sleep this long before restarting on recoverable errors; zero
    /// restarts immediately
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    restartdelay: Duration,
    /// Write an index artifact at the end of a batch run
    #[arg(long, default_value_t = false)]
    index: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let broker_env = BrokerEnv::from_env();
    let broker = broker_config(&broker_env, &args.inbox)?;
    let config = Config {
        inbox: args.inbox,
        archive: args.archive,
        host: args.host,
        secure: args.secure,
        access_key: args.accesskey,
        secret_key: args.secretkey,
        metrics_listen: args.metrics,
        trace: args.trace,
        batch: args.batch,
        batchmetrics: args.batchmetrics,
        restart_delay: args.restartdelay,
        index_write: args.index,
        broker,
    };
    config.validate()?;

    let metrics = Metrics::new();
    let _metrics_server = obs::spawn_metrics_server(&config.metrics_listen, metrics.clone())?;

    let token = CancellationToken::new();
    shutdown::cancel_on_signal(token.clone());

    loop {
        tracing::info!(host = %config.host, https = config.secure, "initializing store client");
        let store: Arc<dyn BlobStore> = Arc::new(S3Store::new(&config.s3_config())?);
        match run_session(&config, store, metrics.clone(), token.clone()).await {
            Ok(SessionOutcome::Completed) => {
                tracing::info!("batch mode completed");
                if config.batchmetrics {
                    if obs::wait_for_scrape(&metrics, BATCHMETRICS_WAIT_MAX).await {
                        tracing::info!("exiting on batch mode final metrics scrape");
                        std::process::exit(0);
                    }
                    tracing::error!(
                        within = ?BATCHMETRICS_WAIT_MAX,
                        "failed to detect a metrics scrape"
                    );
                    std::process::exit(2);
                }
                return Ok(());
            }
            Ok(SessionOutcome::Shutdown) => {
                tracing::info!("shutdown complete");
                return Ok(());
            }
            Err(RunError::Recoverable(msg)) => {
                tracing::info!(delay = ?config.restart_delay, error = %msg, "re-running handler");
                if !config.restart_delay.is_zero() {
                    tokio::time::sleep(config.restart_delay).await;
                }
            }
            Err(RunError::Fatal(msg)) => return Err(msg.into()),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
