use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::sync::Arc;

mod backend;
mod config;
mod events;
mod logging;
mod reconcile;
mod resource;

use backend::{
    Ec2Compute, ObjectStore, RequeueQueue, S3LockService, S3ObjectStore, SqsRequeueQueue, SsmExec,
};
use config::{Settings, Timings};
use events::TriggerEvent;
use reconcile::{Backends, Reconciler};

#[derive(Parser)]
#[command(name = "k3man")]
#[command(version = "0.1.0")]
#[command(about = "Declarative k3s cluster manager for AWS")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one raw trigger event (object-store change, VM state
    /// change, requeue message)
    Handle {
        /// JSON payload; read from stdin when omitted
        #[arg(short, long)]
        event: Option<String>,

        /// Path to a file holding the JSON payload
        #[arg(short = 'f', long)]
        event_file: Option<String>,
    },

    /// Reconcile a single cluster immediately
    Reconcile {
        /// Cluster name
        name: String,
    },

    /// Render the progress view of a cluster
    Status {
        /// Cluster name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::from_env()?;
    logging::init_logging(&settings.logging)?;
    let reconciler = build_reconciler(settings).await;

    match cli.command {
        Command::Handle { event, event_file } => {
            let payload = match (event, event_file) {
                (Some(event), _) => event,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read event file '{}'", path))?,
                (None, None) => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("failed to read event from stdin")?;
                    buffer
                }
            };
            let trigger = TriggerEvent::decode(&payload)?;
            let result = reconciler.handle(&trigger).await;
            print_result(&result);
        }
        Command::Reconcile { name } => {
            let result = reconciler
                .reconcile_cluster(&name)
                .await
                .map_err(|e| anyhow!(e))?;
            print_result(&result);
        }
        Command::Status { name } => match reconciler.progress_view(&name).await? {
            Some(view) => print!("{}", view),
            None => return Err(anyhow!("cluster '{}' not found", name)),
        },
    }

    Ok(())
}

fn print_result(result: &reconcile::ReconcileResult) {
    println!(
        "{}",
        serde_json::json!({
            "requeue": result.requeue,
            "requeueAfter": result.requeue_after.as_secs(),
        })
    );
}

/// Wire the AWS-backed reconciler from process settings
async fn build_reconciler(settings: Settings) -> Reconciler {
    let aws = backend::load_aws_config(&settings.region).await;

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&aws, settings.bucket.clone()));
    let lock = Arc::new(S3LockService::new(store.clone()));
    let compute = Arc::new(Ec2Compute::new(&aws));
    let exec = Arc::new(SsmExec::new(&aws));
    let queue: Option<Arc<dyn RequeueQueue>> = if settings.requeue_queue_url.is_empty() {
        None
    } else {
        Some(Arc::new(SqsRequeueQueue::new(
            &aws,
            settings.requeue_queue_url.clone(),
        )))
    };

    let backends = Backends {
        store,
        lock,
        compute,
        exec,
        queue,
    };
    Reconciler::new(backends, settings, Timings::default())
}
