use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dicom_node::config::{ConfigStore, FileConfigStore, NodeConfig};
use dicom_node::qr::{QrClient, RetrieveJob, RetrieveMode, RetrieveTarget};
use dicom_node::service::{open_provider, ServiceManager, ServiceStats};
use dicom_node::storage::{capacity, downstream_channel, StorageEngine};
use dicom_node::txlog::TransactionLog;
use dimse::QueryLevel;

#[derive(Parser, Debug)]
#[command(name = "dicom-node", version, about = "DICOM storage, query and retrieve node")]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "dicom-node.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SCP until Ctrl-C
    Serve,
    /// C-ECHO a configured peer
    Echo {
        #[arg(long)]
        peer: String,
    },
    /// C-FIND against a peer
    Query {
        #[arg(long)]
        peer: String,
        #[arg(long, default_value = "STUDY")]
        level: QueryLevel,
        /// Filter as Keyword=Value, repeatable
        #[arg(short = 'k', long = "key")]
        keys: Vec<String>,
    },
    /// C-MOVE or C-GET a study or series from a peer
    Retrieve {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        study: String,
        #[arg(long)]
        series: Option<String>,
        #[arg(long, default_value = "get")]
        mode: RetrieveMode,
    },
    /// C-STORE local files to a peer
    Push {
        #[arg(long)]
        peer: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Report storage usage
    Usage {
        /// Evict old files when usage is above the ceiling
        #[arg(long)]
        cleanup: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let node_config = NodeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    dicom_node::init_logging(&node_config.logging).context("initialising logging")?;

    let config: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::open(&args.config).await?);

    match args.command {
        Command::Serve => serve(config).await,
        Command::Echo { peer } => {
            let client = qr_client(config).await?;
            let result = client.echo(&peer).await?;
            print_json(&result)?;
            if !result.success {
                bail!("C-ECHO to {} failed", peer);
            }
            Ok(())
        }
        Command::Query { peer, level, keys } => {
            let mut filters = Vec::with_capacity(keys.len());
            for key in &keys {
                filters.push(dicom_json_tool::parse_filter(key)?);
            }
            let client = qr_client(config).await?;
            let job = client.query(&peer, level, filters).await?;
            print_json(&job)?;
            if let Some(error) = &job.error {
                bail!("query failed: {}", error);
            }
            Ok(())
        }
        Command::Retrieve {
            peer,
            study,
            series,
            mode,
        } => {
            let target = match series {
                Some(series) => RetrieveTarget::series(study, series),
                None => RetrieveTarget::study(study),
            };
            let client = qr_client(config).await?;
            let mut job = RetrieveJob::new(peer, target, mode);
            let mut progress = job.subscribe();
            let reporter = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let p = *progress.borrow_and_update();
                    tracing::info!(
                        "{}: {} completed, {} failed, {} remaining",
                        p.status,
                        p.completed,
                        p.failed,
                        p.remaining
                    );
                }
            });
            client.run_retrieve(&mut job).await?;
            let progress = job.progress();
            drop(job);
            let _ = reporter.await;
            print_json(&progress)?;
            Ok(())
        }
        Command::Push { peer, files } => {
            let client = qr_client(config).await?;
            let summary = client.push(&peer, &files).await?;
            print_json(&summary)?;
            if summary.failed > 0 {
                bail!("{} of {} file(s) failed", summary.failed, summary.reports.len());
            }
            Ok(())
        }
        Command::Usage { cleanup } => {
            let settings = config.hot().await?;
            let root = settings.root.clone();
            let usage = tokio::task::spawn_blocking(move || capacity::scan_usage(&root)).await?;
            println!(
                "{}: {} file(s), {} bytes (ceiling {})",
                settings.root.display(),
                usage.total_files,
                usage.total_bytes,
                if settings.is_unlimited() {
                    "unlimited".to_string()
                } else {
                    format!("{} bytes", settings.max_storage_bytes)
                }
            );
            if cleanup {
                let cold = config.cold().await?;
                let txlog = TransactionLog::open(&cold.paths.txlog_db)?;
                let engine = StorageEngine::new(config.clone(), Some(txlog));
                match engine.enforce_ceiling().await? {
                    Some(stats) => print_json(&stats)?,
                    None => println!("Nothing to clean up"),
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: Arc<dyn ConfigStore>) -> anyhow::Result<()> {
    let manager = ServiceManager::new(config);
    manager.start().await?;
    let mut state = manager.subscribe_state();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            tracing::info!("Shutdown requested");
        }
        _ = state.wait_for(|s| matches!(s, dicom_node::ServiceState::Failed(_))) => {
            tracing::error!("Service failed: {}", manager.state());
        }
    }

    manager.stop().await?;
    let status = manager.status().await;
    print_json(&status.stats)?;
    Ok(())
}

/// Client with the node's own store path for objects pulled by C-GET
async fn qr_client(config: Arc<dyn ConfigStore>) -> anyhow::Result<QrClient> {
    let cold = Arc::new(config.cold().await?);
    let provider = open_provider(
        config.clone(),
        cold.clone(),
        Arc::new(ServiceStats::default()),
        downstream_channel(),
    )?;
    let txlog = provider.txlog().clone();
    Ok(QrClient::new(
        cold.dimse.clone(),
        config,
        provider,
        Some(txlog),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
