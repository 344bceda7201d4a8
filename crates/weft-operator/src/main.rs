//! weft operator - keeps stored ML resources in sync with the runtime

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use weft_common::config::{LeaseBackend, OperatorConfig};
use weft_common::leader_election::kubernetes::KubeLeaseLock;
use weft_common::leader_election::local::LocalLeaseLock;
use weft_common::leader_election::{LeaderElector, LeaseLock};
use weft_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use weft_operator::{local_subsystems, run_with_grace, shutdown_signal, LeaderCoordinator};

/// weft - reconciles storage-declared ML resources against their runtime
#[derive(Parser, Debug)]
#[command(name = "weft-operator", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    /// Lock holder identity, overriding the configured one
    #[arg(long, env = "WEFT_IDENTITY")]
    identity: Option<String>,

    /// Log line encoding: json or text
    #[arg(long, env = "WEFT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// OTLP collector endpoint for spans and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig {
        service_name: "weft-operator".to_string(),
        format: cli.log_format,
        otlp_endpoint: cli.otlp_endpoint.clone(),
    }) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let (coordinator, grace) = match setup(&cli).await {
        Ok(ready) => ready,
        Err(e) => {
            error!(error = %e, "Setup failed");
            std::process::exit(1);
        }
    };

    let coordinator = Arc::new(coordinator);
    let outcome = run_with_grace(
        move |token| async move { coordinator.run(token).await },
        shutdown_signal(),
        grace,
    )
    .await;

    info!(outcome = ?outcome, "weft operator exiting");
    std::process::exit(outcome.exit_code());
}

async fn setup(cli: &Cli) -> anyhow::Result<(LeaderCoordinator, Duration)> {
    let mut config = OperatorConfig::load(cli.config.as_deref())?;
    if cli.identity.is_some() {
        config.identity = cli.identity.clone();
    }
    let identity = config.resolve_identity();
    let election = &config.leader_election;

    let lock: Arc<dyn LeaseLock> = match election.backend {
        LeaseBackend::Kubernetes => Arc::new(
            KubeLeaseLock::try_default(&election.lease_name, &election.namespace)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create lease client: {}", e))?,
        ),
        LeaseBackend::Local => Arc::new(LocalLeaseLock::new()),
    };
    let elector = Arc::new(LeaderElector::new(lock, &identity, election.timing())?);

    let (subsystems, _backends) = local_subsystems(&config);
    info!(
        identity = %identity,
        backend = ?election.backend,
        workers = subsystems.reconciler.len(),
        "weft operator starting"
    );

    let coordinator = LeaderCoordinator::new(elector, subsystems.reconciler, subsystems.watcher);
    Ok((coordinator, config.graceful_timeout()))
}
