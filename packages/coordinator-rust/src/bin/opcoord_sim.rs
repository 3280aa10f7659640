//! Drives an [`OperationCoordinator`] with simulated capture and
//! transcription services and prints the resulting state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use opcoord_coordinator::{
    CategoryGroup, CoordinatorConfig, OperationCoordinator, StatusDelegate, StatusFilter,
};
use opcoord_core::{
    Category, EntityId, Operation, OperationId, OperationStatus, OperationType, Priority, Progress,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "opcoord-sim", about = "Simulate capture and transcription work")]
struct Args {
    /// Number of recordings to capture and transcribe.
    #[arg(long, env = "OPCOORD_RECORDINGS", default_value_t = 6)]
    recordings: usize,

    /// Concurrency ceiling.
    #[arg(long, env = "OPCOORD_MAX_CONCURRENT", default_value_t = 3)]
    max_concurrent: usize,

    /// History cap before the count sweep runs.
    #[arg(long, env = "OPCOORD_MAX_HISTORY", default_value_t = 100)]
    max_history: usize,

    /// Simulated duration of each unit of work.
    #[arg(long, env = "OPCOORD_WORK_MS", default_value_t = 200)]
    work_ms: u64,

    /// Emit JSON logs and print system metrics as JSON.
    #[arg(long, env = "OPCOORD_JSON")]
    json: bool,

    /// Serve Prometheus metrics on this address while the simulation runs.
    #[arg(long, env = "OPCOORD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

const STEPS: u32 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);
    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
    }

    let config = CoordinatorConfig {
        max_concurrent_operations: args.max_concurrent,
        max_history: args.max_history,
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(OperationCoordinator::new(config).context("invalid configuration")?);

    let delegate: Arc<dyn StatusDelegate> = Arc::new(|op: &Operation| {
        info!(
            operation_id = %op.id(),
            category = %op.category(),
            entity = %op.entity(),
            status = %op.status(),
            "status changed"
        );
    });
    coordinator.set_status_delegate(Some(delegate));
    coordinator.start_cleanup().await;

    let work = Duration::from_millis(args.work_ms);
    let mut tasks = Vec::with_capacity(args.recordings);
    for i in 0..args.recordings {
        let coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            simulate_recording(&coordinator, i, work).await
        }));
    }
    for task in tasks {
        if let Err(err) = task.await.context("recording task panicked")? {
            warn!(error = %err, "recording did not finish");
        }
    }

    coordinator.run_cleanup_now();
    coordinator.publish_metrics();
    println!("{}", coordinator.debug_dump());
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&coordinator.system_metrics())?
        );
        let failures = coordinator.summaries(CategoryGroup::All, StatusFilter::Failed, None);
        println!("{}", serde_json::to_string_pretty(&failures)?);
    }

    coordinator.stop_cleanup().await;
    Ok(())
}

/// Capture then transcribe one recording, the way the owning services would.
async fn simulate_recording(
    coordinator: &OperationCoordinator,
    index: usize,
    work: Duration,
) -> anyhow::Result<()> {
    let recording = EntityId::new(format!("recording-{index}"));

    let capture = coordinator.register(OperationType::capture(recording.clone()), Priority::High)?;
    if !run_to_completion(coordinator, capture, work, None).await {
        return Ok(());
    }

    if !coordinator.can_admit(Category::Transcription, &recording) {
        anyhow::bail!("transcription not admissible for {recording}");
    }
    let transcription =
        coordinator.register(OperationType::transcription(recording), Priority::Medium)?;
    let failure = (index % 5 == 4).then_some("simulated decoder error");
    run_to_completion(coordinator, transcription, work, failure).await;
    Ok(())
}

/// Waits for admission, does the work in steps while reporting progress, and
/// stops early if the operation is cancelled. Returns whether it completed.
async fn run_to_completion(
    coordinator: &OperationCoordinator,
    id: OperationId,
    work: Duration,
    failure: Option<&str>,
) -> bool {
    coordinator.start(id);
    if !wait_until_active(coordinator, id).await {
        return false;
    }

    for step in 1..=STEPS {
        tokio::time::sleep(work / STEPS).await;
        if coordinator.status(id) != Some(OperationStatus::Active) {
            return false;
        }
        coordinator.update_progress(
            id,
            Progress::new(f64::from(step) / f64::from(STEPS), format!("step {step}/{STEPS}")),
        );
    }

    match failure {
        Some(reason) => {
            coordinator.fail(id, reason);
            false
        }
        None => coordinator.complete(id),
    }
}

/// Polls until the scheduler admits `id`. False if it ends without starting.
async fn wait_until_active(coordinator: &OperationCoordinator, id: OperationId) -> bool {
    loop {
        match coordinator.status(id) {
            Some(OperationStatus::Active) => return true,
            Some(OperationStatus::Pending) => tokio::time::sleep(Duration::from_millis(10)).await,
            _ => return false,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
