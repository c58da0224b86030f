//! Warden - standalone node.
//!
//! Wires the dispatcher, metrics, punishment cache and identity cache from
//! the environment and keeps them running until Ctrl+C. On Unix, SIGHUP
//! re-reads cache and metrics settings.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::config::{Config, IdentityStorage};
use warden::database::{Database, MongoIdentityLog, MongoPunishmentStore};
use warden::dispatch::{ConfinedThread, SchedulerFlavor, TaskDispatcher};
use warden::identity::{FileIdentityLog, IdentityCache, IdentityLogStore, KeySources, LineCipher, resolve_key};
use warden::metrics::MetricsRecorder;
use warden::punishments::{InMemoryPunishmentStore, PunishmentCache, PunishmentStore};

/// How long shutdown waits for the identity log to settle.
const PERSISTENCE_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warden=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("Starting Warden...");

    let config = Config::from_env();
    info!("Configuration loaded successfully");

    // Execution contexts
    let confined = Arc::new(ConfinedThread::spawn("warden-main")?);
    let dispatcher = TaskDispatcher::new(confined.clone())?;
    let flavor = SchedulerFlavor::detect(&config.server_name);
    let scheduler = flavor.scheduler(dispatcher.clone());
    info!("Host scheduler: {:?}", flavor);

    let metrics = MetricsRecorder::new(scheduler.clone(), config.metrics);

    // Storage collaborators
    let database = match config.mongodb_uri.clone() {
        Some(uri) => {
            info!("Connecting to MongoDB...");
            let name = config.mongodb_database.clone();
            let db = dispatcher.supply_async(move || Database::connect(&uri, &name)).await?;
            Some(db)
        }
        None => {
            warn!("MONGODB_URI not set; punishments are kept in memory only");
            None
        }
    };

    let punishment_store: Arc<dyn PunishmentStore> = match &database {
        Some(db) => {
            let store = MongoPunishmentStore::new(db);
            let indexed = store.clone();
            if let Err(e) = dispatcher.supply_async(move || indexed.ensure_indexes()).await {
                warn!("Could not create punishment indexes: {}", e);
            }
            Arc::new(store)
        }
        None => Arc::new(InMemoryPunishmentStore::new()),
    };

    let identity_log: Arc<dyn IdentityLogStore> = match (config.identity_storage, &database) {
        (IdentityStorage::Database, Some(db)) => Arc::new(MongoIdentityLog::new(db)),
        (IdentityStorage::Database, None) => {
            warn!("IDENTITY_STORAGE=database without MONGODB_URI; using the log file");
            Arc::new(FileIdentityLog::in_dir(&config.data_dir))
        }
        (IdentityStorage::File, _) => Arc::new(FileIdentityLog::in_dir(&config.data_dir)),
    };

    // Caches
    let punishments = PunishmentCache::builder()
        .dispatcher(dispatcher.clone())
        .store(punishment_store)
        .scheduler(scheduler.clone())
        .metrics(metrics.clone())
        .settings(config.cache)
        .build()?;

    let sources = KeySources::from_env(config.identity_secret_key.clone(), &config.data_dir);
    let key = dispatcher.supply_async(move || Ok(resolve_key(&sources))).await?;
    let identities = IdentityCache::builder()
        .dispatcher(dispatcher.clone())
        .log(identity_log)
        .cipher(LineCipher::new(key.as_bytes())?)
        .geo_timeout(config.geoip_timeout)
        .metrics(metrics.clone())
        .build()?;

    identities.ready().await?;
    info!("Warden is ready");

    wait_for_shutdown(&punishments, &metrics).await?;

    info!("Shutting down...");
    punishments.shutdown();
    if !identities.wait_for_persistence(PERSISTENCE_GRACE).await {
        warn!("Identity log did not settle before shutdown");
    }
    metrics.close();
    dispatcher.close();
    confined.stop();
    info!("Goodbye");

    Ok(())
}

/// Block until Ctrl+C, applying configuration reloads on SIGHUP meanwhile.
#[cfg(unix)]
async fn wait_for_shutdown(punishments: &PunishmentCache, metrics: &MetricsRecorder) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => {
                let config = Config::from_env();
                punishments.refresh_configuration(config.cache);
                metrics.refresh_configuration(config.metrics);
                info!("Configuration reloaded");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_punishments: &PunishmentCache, _metrics: &MetricsRecorder) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
