use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};

use cadence_common::{
    ContactDirectory, Contacts, LoggingTransport, PassthroughRenderer, Recipient, Signal,
    internal, logging, tracing,
};
use cadence_control::{ControlAuthConfig, ControlServer, DEFAULT_CONTROL_SOCKET};
use cadence_delivery::{DeliveryContext, DeliveryProcessor, DeliveryQueryService};
use cadence_experiment::{ExperimentContext, ExperimentEngine};
use cadence_monitor::{Monitor, MonitorContext};
use cadence_store::{MemoryBackingStore, ScheduleConfig, ScheduleStore};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::control_handler::CadenceControlHandler;

const CONFIG_ENV: &str = "CADENCE_CONFIG";

const fn default_snapshot_interval() -> u64 {
    300
}

const fn default_control_enabled() -> bool {
    true
}

const fn default_request_timeout() -> u64 {
    30
}

fn default_control_socket() -> String {
    DEFAULT_CONTROL_SOCKET.to_string()
}

/// Where the in-memory store is persisted between runs
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Snapshot restored at startup and written on shutdown. Nothing is
    /// persisted when unset.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,

    /// How often the snapshot is refreshed while running (in seconds)
    ///
    /// Default: 300 seconds
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot: None,
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

impl StoreConfig {
    async fn open(&self) -> anyhow::Result<MemoryBackingStore> {
        match &self.snapshot {
            Some(path) if path.exists() => Ok(MemoryBackingStore::load(path).await?),
            Some(path) => {
                internal!(
                    level = INFO,
                    "No snapshot at {}, starting empty",
                    path.display()
                );
                Ok(MemoryBackingStore::new())
            }
            None => Ok(MemoryBackingStore::new()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Default: `/tmp/cadence.sock`
    #[serde(default = "default_control_socket")]
    pub socket: String,

    /// Default: true
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub auth: ControlAuthConfig,

    /// How long a connected client may stay silent (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_control_socket(),
            enabled: default_control_enabled(),
            auth: ControlAuthConfig::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// A recipient of the built-in contact directory and the tags they carry
#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    pub recipient: Recipient,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Cadence {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    schedule: ScheduleConfig,
    #[serde(default)]
    delivery: DeliveryProcessor,
    #[serde(default)]
    experiment: ExperimentEngine,
    #[serde(default)]
    monitor: Monitor,
    #[serde(default)]
    control: ControlConfig,
    #[serde(alias = "contact", default)]
    contacts: Vec<Contact>,
}

/// Every component wired against one store
#[derive(Debug)]
pub struct Services {
    pub store: MemoryBackingStore,
    pub delivery: Arc<DeliveryProcessor>,
    pub experiment: Arc<ExperimentEngine>,
    pub monitor: Arc<Monitor>,
    pub handler: Arc<CadenceControlHandler>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Refresh the snapshot on a timer until shutdown
async fn persist(
    store: &MemoryBackingStore,
    path: Option<&Path>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };

    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = store.save(path).await {
                    tracing::warn!("Failed to write snapshot to {}: {e}", path.display());
                }
            }
            sig = shutdown.recv() => {
                match sig {
                    Ok(Signal::Shutdown | Signal::Finalised) | Err(_) => return Ok(()),
                }
            }
        }
    }
}

impl Cadence {
    /// Parse a RON configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration
    pub fn parse(config: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(config)?)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;
        Self::parse(&content)
    }

    /// Load the configuration found by [`locate_from`]
    ///
    /// # Errors
    ///
    /// Returns an error if no configuration file exists or it is invalid
    pub fn load() -> anyhow::Result<Self> {
        Self::from_file(&locate_from(std::env::var_os(CONFIG_ENV))?)
    }

    /// Initialise every component against `store`
    ///
    /// # Errors
    ///
    /// Returns an error if any component's configuration is invalid
    pub fn build(self, store: MemoryBackingStore) -> anyhow::Result<Services> {
        let Self {
            schedule,
            mut delivery,
            mut experiment,
            mut monitor,
            contacts,
            ..
        } = self;

        let directory = ContactDirectory::new();
        for contact in contacts {
            let tags: Vec<&str> = contact.tags.iter().map(String::as_str).collect();
            directory.insert(contact.recipient, &tags);
        }
        internal!(level = INFO, "Loaded {} contacts", directory.len());
        let contacts: Arc<dyn Contacts> = Arc::new(directory);

        let backing = Arc::new(store.clone());
        let schedule = ScheduleStore::new(backing.clone(), schedule);

        delivery.init(DeliveryContext {
            schedule: schedule.clone(),
            log: backing.clone(),
            contacts: Arc::clone(&contacts),
            transport: Arc::new(LoggingTransport),
            renderer: Arc::new(PassthroughRenderer),
            plans: None,
        })?;
        let delivery = Arc::new(delivery);

        experiment.init(ExperimentContext {
            schedule,
            log: backing.clone(),
            contacts,
        })?;
        let experiment = Arc::new(experiment);

        let query: Arc<dyn DeliveryQueryService> = delivery.clone();
        monitor.init(MonitorContext {
            store: backing.clone(),
            log: backing,
            delivery: Arc::clone(&query),
        })?;
        let monitor = Arc::new(monitor);

        let handler = Arc::new(CadenceControlHandler::new(
            query,
            Arc::clone(&experiment),
            Arc::clone(&monitor),
        ));

        Ok(Services {
            store,
            delivery,
            experiment,
            monitor,
            handler,
        })
    }

    /// Run the scheduler, and everything it controls, until shutdown
    ///
    /// # Errors
    ///
    /// This function will return an error if any component fails to
    /// initialise, or a service stops with an error.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init();

        let store_config = std::mem::take(&mut self.store);
        let control = std::mem::take(&mut self.control);
        let store = store_config.open().await?;

        let services = self.build(store)?;

        internal!("Controller running");

        let server = if control.enabled {
            Some(
                ControlServer::new(control.socket.clone(), services.handler.clone())?
                    .with_auth(control.auth.clone())
                    .with_timeout(Duration::from_secs(control.request_timeout_secs)),
            )
        } else {
            internal!(level = INFO, "Control socket disabled");
            None
        };

        let delivery = services.delivery.serve(SHUTDOWN_BROADCAST.subscribe());
        let experiment = services.experiment.serve(SHUTDOWN_BROADCAST.subscribe());
        let monitor = services.monitor.serve(SHUTDOWN_BROADCAST.subscribe());
        let snapshots = persist(
            &services.store,
            store_config.snapshot.as_deref(),
            Duration::from_secs(store_config.snapshot_interval_secs.max(1)),
            SHUTDOWN_BROADCAST.subscribe(),
        );
        let control_rx = SHUTDOWN_BROADCAST.subscribe();
        let control = async {
            match &server {
                Some(server) => Ok(server.serve(control_rx).await?),
                None => Ok::<(), anyhow::Error>(()),
            }
        };

        let ret = tokio::select! {
            r = async {
                tokio::try_join!(
                    async { Ok::<(), anyhow::Error>(delivery.await?) },
                    async { Ok::<(), anyhow::Error>(experiment.await?) },
                    async { Ok::<(), anyhow::Error>(monitor.await?) },
                    snapshots,
                    control,
                )
                .map(|_| ())
            } => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        if let Some(path) = &store_config.snapshot {
            services.store.save(path).await?;
        }

        ret
    }
}

/// Find the configuration file using the following precedence:
/// 1. `CADENCE_CONFIG` environment variable (passed in as `env`)
/// 2. ./cadence.config.ron (current working directory)
/// 3. /etc/cadence/cadence.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if `env` names a missing file, or none of the defaults
/// exist
pub fn locate_from(env: Option<OsString>) -> anyhow::Result<PathBuf> {
    if let Some(env_path) = env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./cadence.config.ron"),
        PathBuf::from("/etc/cadence/cadence.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
