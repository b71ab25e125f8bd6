//! PortalSync command-line client.

mod config;
mod reporter;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portalsync_graph::{JsonFileBacking, ObjectGraph};
use portalsync_net::HttpTransport;
use portalsync_portal::{ConsentForms, ConsentVideos, PatientSketches, PortalJob, start};

use config::AppConfig;
use reporter::TracingReporter;

#[derive(Debug, Parser)]
#[command(name = "portalsync", version, about = "Synchronize with the consent portal")]
struct Cli {
    /// Configuration file (default: ~/.config/portalsync/portalsync.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download new and changed consent videos.
    Videos,
    /// Download sketches for the given patients.
    Sketches {
        #[arg(required = true)]
        patients: Vec<String>,
    },
    /// Upload consent forms that have not reached the portal yet.
    Forms,
}

impl Command {
    fn job(self, config: &AppConfig) -> PortalJob {
        match self {
            Command::Videos => PortalJob::ConsentVideos(ConsentVideos::new(&config.media_dir)),
            Command::Sketches { patients } => {
                PortalJob::PatientSketches(PatientSketches::new(patients))
            }
            Command::Forms => PortalJob::ConsentForms(ConsentForms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,portalsync=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    if config.net.base_url.is_empty() {
        anyhow::bail!("no portal address: set [net].base_url in the configuration");
    }
    let account = config.account(|key| std::env::var(key).ok())?;

    let job = cli.command.job(&config);
    let name = job.name();
    let direction = job.direction();

    let graph = ObjectGraph::open(JsonFileBacking::new(&config.graph_path))
        .with_context(|| format!("opening {}", config.graph_path.display()))?;
    let transport = Arc::new(HttpTransport::new(config.net.timeout())?);
    let reporter = Arc::new(TracingReporter::new(name));

    let (tx, rx) = oneshot::channel();
    let net = Arc::new(
        job.session(config.net.clone(), transport, graph, &account, move |err| {
            let _ = tx.send(err);
        })
        .with_reporter(&reporter),
    );

    info!(job = name, %direction, user = %account.username, session = %net.session_id(), "starting");
    if !start(&net, direction) {
        anyhow::bail!("{name}: session refused to start");
    }

    let interrupt = {
        let net = net.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling session");
                net.cancel();
            }
        })
    };

    let outcome = rx.await.context("session ended without reporting")?;
    interrupt.abort();
    net.wait().await;

    match outcome {
        None => {
            println!("{name}: {} operations completed", net.completed());
            Ok(())
        }
        Some(err) => Err(anyhow::Error::new(err).context(format!("{name} failed"))),
    }
}
