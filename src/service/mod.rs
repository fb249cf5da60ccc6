//! Lifecycle of the long-running DICOM node.
//!
//! The process entry point owns one [`ServiceManager`]. Cold settings are read once
//! per `start()`; the only way to apply new cold settings is `restart()`.

pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dimse::{DimseError, DimseScp};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ColdSnapshot, ConfigError, ConfigStore, HotSettings};
use crate::index::{IndexError, SeriesIndex};
use crate::provider::NodeProvider;
use crate::qr::QrClient;
use crate::storage::{downstream_channel, StorageEngine, StoredObject};
use crate::txlog::{TransactionLog, TxLogError};

pub use stats::{ServiceStats, StatsSnapshot};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Transaction log error: {0}")]
    TxLog(#[from] TxLogError),

    #[error(transparent)]
    Dimse(#[from] DimseError),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: String, source: DimseError },

    #[error("Cannot {action} while the service is {state}")]
    InvalidState {
        action: &'static str,
        state: ServiceState,
    },
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => f.write_str("stopped"),
            ServiceState::Starting => f.write_str("starting"),
            ServiceState::Running => f.write_str("running"),
            ServiceState::Stopping => f.write_str("stopping"),
            ServiceState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub ae_title: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stats: StatsSnapshot,
}

/// Everything that exists only while the listener runs
struct Running {
    cold: Arc<ColdSnapshot>,
    scp: DimseScp,
    provider: Arc<NodeProvider>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    listener: JoinHandle<()>,
    refresher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

/// Open the databases and build the provider for one cold snapshot
pub fn open_provider(
    config: Arc<dyn ConfigStore>,
    cold: Arc<ColdSnapshot>,
    stats: Arc<ServiceStats>,
    downstream: broadcast::Sender<StoredObject>,
) -> Result<Arc<NodeProvider>> {
    let index = SeriesIndex::open(&cold.paths.index_db)?;
    let txlog = TransactionLog::open(&cold.paths.txlog_db)?;
    let storage = Arc::new(StorageEngine::with_downstream(
        config.clone(),
        Some(txlog.clone()),
        downstream,
    ));
    Ok(Arc::new(NodeProvider::new(
        config, cold, index, txlog, storage, stats,
    )))
}

async fn refresh_hot(
    config: &Arc<dyn ConfigStore>,
    hot: &RwLock<Option<HotSettings>>,
) -> std::result::Result<HotSettings, ConfigError> {
    let settings = config.hot().await?;
    settings.validate()?;
    *hot.write().await = Some(settings.clone());
    Ok(settings)
}

pub struct ServiceManager {
    config: Arc<dyn ConfigStore>,
    state: Arc<watch::Sender<ServiceState>>,
    lifecycle: Mutex<Lifecycle>,
    hot: Arc<RwLock<Option<HotSettings>>>,
    stats: Arc<ServiceStats>,
    downstream: broadcast::Sender<StoredObject>,
}

impl ServiceManager {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            config,
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::default()),
            hot: Arc::new(RwLock::new(None)),
            stats: Arc::new(ServiceStats::default()),
            downstream: downstream_channel(),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    /// Follow state changes, including a listener failure while running
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Objects stored while `trigger_downstream` is on
    pub fn subscribe_stored(&self) -> broadcast::Receiver<StoredObject> {
        self.downstream.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if lifecycle.running.is_some() || matches!(current, ServiceState::Starting | ServiceState::Stopping) {
            return Err(ServiceError::InvalidState {
                action: "start",
                state: current,
            });
        }

        self.set_state(ServiceState::Starting);
        match self.launch().await {
            Ok(running) => {
                tracing::info!(
                    "🚀 DICOM node {} running on {}",
                    running.cold.dimse.local_aet,
                    running.local_addr
                );
                lifecycle.running = Some(running);
                lifecycle.started_at = Some(Utc::now());
                lifecycle.stopped_at = None;
                self.set_state(ServiceState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start DICOM node: {}", e);
                self.set_state(ServiceState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        let cold = Arc::new(self.config.cold().await?);
        cold.dimse.validate()?;
        refresh_hot(&self.config, &self.hot).await?;

        let provider = open_provider(
            self.config.clone(),
            cold.clone(),
            self.stats.clone(),
            self.downstream.clone(),
        )?;
        let scp = DimseScp::new(cold.dimse.clone(), provider.clone())?;
        let listener = scp.bind().await.map_err(|source| ServiceError::Bind {
            addr: format!("{}:{}", cold.dimse.bind_addr, cold.dimse.port),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(DimseError::from)?;

        let shutdown = CancellationToken::new();
        let listener = {
            let scp = scp.clone();
            let token = shutdown.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = scp.run(listener, token).await {
                    tracing::error!("DIMSE listener failed: {}", e);
                    state.send_replace(ServiceState::Failed(e.to_string()));
                }
            })
        };

        let refresher = cold.refresh_interval.map(|period| {
            let config = self.config.clone();
            let hot = self.hot.clone();
            let token = shutdown.clone();
            tokio::spawn(periodic_refresh(config, hot, period, token))
        });

        Ok(Running {
            cold,
            scp,
            provider,
            local_addr,
            shutdown,
            listener,
            refresher,
        })
    }

    /// Stop accepting, give running associations the grace period, then abort them
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut running) = lifecycle.running.take() else {
            if matches!(self.state(), ServiceState::Failed(_)) {
                self.set_state(ServiceState::Stopped);
            }
            return Ok(());
        };

        self.set_state(ServiceState::Stopping);
        tracing::info!("🛑 Stopping DICOM node {}", running.cold.dimse.local_aet);
        running.shutdown.cancel();
        if let Some(refresher) = running.refresher.take() {
            refresher.abort();
        }

        // the listener applies the grace period itself; this only bounds a stuck task
        let limit = running.cold.dimse.shutdown_grace() + Duration::from_secs(1);
        if tokio::time::timeout(limit, &mut running.listener).await.is_err() {
            tracing::warn!("Listener did not stop within {:?}, aborting", limit);
            running.listener.abort();
        }

        lifecycle.stopped_at = Some(Utc::now());
        self.set_state(ServiceState::Stopped);
        tracing::info!("DICOM node stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Re-read hot settings without touching the listener
    pub async fn refresh_config(&self) -> Result<HotSettings> {
        let settings = refresh_hot(&self.config, &self.hot).await?;
        tracing::info!("🔄 Storage settings refreshed (root {})", settings.root.display());
        Ok(settings)
    }

    /// Hot settings as of the last start or refresh
    pub async fn hot_snapshot(&self) -> Option<HotSettings> {
        self.hot.read().await.clone()
    }

    /// Cold settings the running listener was started with
    pub async fn cold_snapshot(&self) -> Option<Arc<ColdSnapshot>> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.running.as_ref().map(|r| r.cold.clone())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.running.as_ref().map(|r| r.local_addr)
    }

    pub async fn transaction_log(&self) -> Option<TransactionLog> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.running.as_ref().map(|r| r.provider.txlog().clone())
    }

    /// A client whose C-GET objects go through the running node's store path
    pub async fn qr_client(&self) -> Option<QrClient> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.running.as_ref().map(|r| {
            QrClient::new(
                r.cold.dimse.clone(),
                self.config.clone(),
                r.provider.clone(),
                Some(r.provider.txlog().clone()),
            )
        })
    }

    pub async fn status(&self) -> ServiceStatus {
        let lifecycle = self.lifecycle.lock().await;
        let running = lifecycle.running.as_ref();
        let active = running.map_or(0, |r| r.scp.active_associations() as u64);
        ServiceStatus {
            state: self.state(),
            ae_title: running.map(|r| r.cold.dimse.local_aet.clone()),
            local_addr: running.map(|r| r.local_addr),
            started_at: lifecycle.started_at,
            stopped_at: lifecycle.stopped_at,
            stats: self.stats.snapshot(active),
        }
    }
}

async fn periodic_refresh(
    config: Arc<dyn ConfigStore>,
    hot: Arc<RwLock<Option<HotSettings>>>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match refresh_hot(&config, &hot).await {
                    Ok(_) => tracing::debug!("Periodic settings refresh done"),
                    Err(e) => tracing::warn!("Periodic settings refresh failed: {}", e),
                }
            }
        }
    }
}
