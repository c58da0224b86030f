//! Indexed, encrypted, persisted cache of identity observations.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cipher::LineCipher;
use super::geo::{DisabledGeoResolver, GeoLocation, GeoResolver};
use super::index::IdentityIndex;
use super::log::IdentityLogStore;
use super::record::IdentityRecord;
use crate::BuildError;
use crate::dispatch::{TaskDispatcher, TaskError};
use crate::metrics::{MetricsRecorder, measure};

const DEFAULT_GEO_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    /// The initial log load failed; the cache refuses to answer rather than
    /// pretend to be empty.
    #[error("identity cache failed to initialize: {0}")]
    Initialization(TaskError),
}

type InitFuture = Shared<BoxFuture<'static, Result<(), TaskError>>>;

/// Every (name, subject, ip) triple ever observed, indexed three ways and
/// persisted as an encrypted log.
///
/// Construction starts one background load; every operation awaits it
/// first. Reads are served from memory only. Cloning is cheap.
#[derive(Clone)]
pub struct IdentityCache {
    state: Arc<State>,
    initialized: InitFuture,
}

struct State {
    dispatcher: TaskDispatcher,
    log: Arc<dyn IdentityLogStore>,
    cipher: LineCipher,
    geo: Arc<dyn GeoResolver>,
    geo_timeout: Duration,
    metrics: Option<Arc<MetricsRecorder>>,
    records: DashMap<String, IdentityRecord>,
    index: IdentityIndex,
    pending: Mutex<VecDeque<IdentityRecord>>,
    /// Deletions cannot be appended; the next flush rewrites the whole log.
    rewrite_requested: AtomicBool,
    flush_scheduled: AtomicBool,
    /// Signalled whenever a flush finishes.
    flushed: Notify,
}

/// Builder for [`IdentityCache`].
#[derive(Default)]
pub struct IdentityCacheBuilder {
    dispatcher: Option<TaskDispatcher>,
    log: Option<Arc<dyn IdentityLogStore>>,
    cipher: Option<LineCipher>,
    geo: Option<Arc<dyn GeoResolver>>,
    geo_timeout: Option<Duration>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl IdentityCacheBuilder {
    pub fn dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn log(mut self, log: Arc<dyn IdentityLogStore>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn cipher(mut self, cipher: LineCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Optional: geolocation is disabled by default.
    pub fn geo(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn geo_timeout(mut self, timeout: Duration) -> Self {
        self.geo_timeout = Some(timeout);
        self
    }

    /// Optional: time log loads and flushes.
    pub fn metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the cache and start loading the log on the worker pool.
    pub fn build(self) -> Result<IdentityCache, BuildError> {
        let dispatcher = self.dispatcher.ok_or(BuildError::Missing("dispatcher"))?;
        let log = self.log.ok_or(BuildError::Missing("identity log store"))?;
        let cipher = self.cipher.ok_or(BuildError::Missing("cipher"))?;

        let state = Arc::new(State {
            dispatcher,
            log,
            cipher,
            geo: self.geo.unwrap_or_else(|| Arc::new(DisabledGeoResolver)),
            geo_timeout: self.geo_timeout.unwrap_or(DEFAULT_GEO_TIMEOUT),
            metrics: self.metrics,
            records: DashMap::new(),
            index: IdentityIndex::new(),
            pending: Mutex::new(VecDeque::new()),
            rewrite_requested: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
            flushed: Notify::new(),
        });

        let loader = Arc::clone(&state);
        let initialized = state
            .dispatcher
            .supply_async(move || measure(loader.metrics.as_deref(), "identity.load", || loader.load()))
            .map(|result| {
                if let Err(e) = &result {
                    warn!("Identity cache initialization failed: {}", e);
                }
                result
            })
            .boxed()
            .shared();

        Ok(IdentityCache { state, initialized })
    }
}

impl IdentityCache {
    pub fn builder() -> IdentityCacheBuilder {
        IdentityCacheBuilder::default()
    }

    /// Resolves once the log has been loaded.
    pub async fn ready(&self) -> Result<(), IdentityError> {
        debug_assert!(
            !self.state.dispatcher.is_confined_thread(),
            "identity cache awaited on the confined thread"
        );
        self.initialized
            .clone()
            .await
            .map_err(IdentityError::Initialization)
    }

    /// Remember a session join.
    ///
    /// Returns the stored record, or `None` when this (subject, ip) pair is
    /// already known. A known pair keeps its original record.
    pub async fn record_join(
        &self,
        name: &str,
        subject: Uuid,
        ip: &str,
    ) -> Result<Option<IdentityRecord>, IdentityError> {
        self.ready().await?;

        if self.state.find(Some(name), Some(subject), Some(ip)).is_some() {
            debug!("Identity already known: {} / {} / {}", name, subject, ip);
            return Ok(None);
        }

        let location = self.resolve_geo(ip).await;
        let record = IdentityRecord::observed_now(name, subject, ip, location.to_string());
        let key = record.key();

        match self.state.records.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!("Identity already known: {} / {}", subject, ip);
                return Ok(None);
            }
            Entry::Vacant(slot) => {
                // Index and queue while the shard is still locked, so a
                // concurrent delete of this key sees all three or none.
                let _stored = slot.insert(record.clone());
                self.state.index.insert(&key, &record);
                self.state.pending.lock().push_back(record.clone());
            }
        }
        self.state.schedule_flush(false);

        debug!("Stored identity {} / {} / {} ({})", name, subject, ip, record.geo_location);
        Ok(Some(record))
    }

    /// Forget every record of `subject`. Returns how many were removed.
    pub async fn delete_subject(&self, subject: Uuid) -> Result<usize, IdentityError> {
        self.ready().await?;

        let keys: Vec<String> = self
            .state
            .records
            .iter()
            .filter(|entry| entry.value().subject == subject)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Entry::Occupied(entry) = self.state.records.entry(key) {
                self.state.index.remove(entry.key(), entry.get());
                entry.remove();
                removed += 1;
            }
        }

        if removed > 0 {
            self.state.schedule_flush(true);
            debug!("Removed {} identity record(s) for {}", removed, subject);
        }
        Ok(removed)
    }

    /// First record matching every given field, case-insensitively.
    pub async fn find(
        &self,
        name: Option<&str>,
        subject: Option<Uuid>,
        ip: Option<&str>,
    ) -> Result<Option<IdentityRecord>, IdentityError> {
        self.ready().await?;
        Ok(self.state.find(name, subject, ip))
    }

    /// IP most recently observed for `name`.
    pub async fn ip_by_name(&self, name: &str) -> Result<Option<String>, IdentityError> {
        self.ready().await?;
        let keys = self.state.index.keys_for_name(name);
        Ok(latest(self.state.resolve(&keys)).map(|r| r.ip))
    }

    /// IP most recently observed for `subject`.
    pub async fn ip_by_subject(&self, subject: Uuid) -> Result<Option<String>, IdentityError> {
        self.ready().await?;
        let keys = self.state.index.keys_for_subject(subject);
        Ok(latest(self.state.resolve(&keys)).map(|r| r.ip))
    }

    /// Every IP used by `name`, oldest observation first.
    pub async fn ips_by_name(&self, name: &str) -> Result<Vec<String>, IdentityError> {
        self.ready().await?;
        let keys = self.state.index.keys_for_name(name);
        Ok(ips(self.state.resolve(&keys)))
    }

    /// Every IP used by `subject`, oldest observation first.
    pub async fn ips_by_subject(&self, subject: Uuid) -> Result<Vec<String>, IdentityError> {
        self.ready().await?;
        let keys = self.state.index.keys_for_subject(subject);
        Ok(ips(self.state.resolve(&keys)))
    }

    /// Every record observed behind `ip`.
    pub async fn records_by_ip(&self, ip: &str) -> Result<Vec<IdentityRecord>, IdentityError> {
        self.ready().await?;
        let keys = self.state.index.keys_for_ip(ip);
        Ok(self.state.resolve(&keys))
    }

    /// Snapshot of all records.
    pub async fn records(&self) -> Result<Vec<IdentityRecord>, IdentityError> {
        self.ready().await?;
        Ok(self.state.records.iter().map(|e| e.value().clone()).collect())
    }

    /// Wait until no flush is running or owed, up to `grace`.
    ///
    /// Returns `false` if the log did not settle in time (or the last flush
    /// failed and nothing has retried it yet).
    pub async fn wait_for_persistence(&self, grace: Duration) -> bool {
        if self.ready().await.is_err() {
            return false;
        }

        let state = Arc::clone(&self.state);
        let waited = self.state.dispatcher.spawn(async move {
            let settled = tokio::time::timeout(grace, async {
                loop {
                    let flushed = state.flushed.notified();
                    tokio::pin!(flushed);
                    // Register before checking so a flush finishing in between still wakes us.
                    flushed.as_mut().enable();
                    if state.is_settled() {
                        return;
                    }
                    flushed.await;
                }
            })
            .await;
            Ok(settled.is_ok())
        });
        waited.await.unwrap_or(false)
    }

    async fn resolve_geo(&self, ip: &str) -> GeoLocation {
        if !self.state.geo.is_enabled() {
            return GeoLocation::unknown();
        }

        let geo = Arc::clone(&self.state.geo);
        let target = ip.to_string();
        let lookup = self.state.dispatcher.supply_async(move || Ok(geo.lookup(&target)));

        // The timer runs on the dispatcher's runtime.
        let timeout = self.state.geo_timeout;
        let bounded = self
            .state
            .dispatcher
            .spawn(async move { Ok(tokio::time::timeout(timeout, lookup).await) });

        match bounded.await {
            Ok(Ok(Ok(location))) => location,
            Ok(Ok(Err(e))) => {
                debug!("GeoIP lookup failed for {}: {}", ip, e);
                GeoLocation::unknown()
            }
            Ok(Err(_)) => {
                debug!("GeoIP lookup for {} timed out after {:?}", ip, timeout);
                GeoLocation::unknown()
            }
            Err(e) => {
                debug!("GeoIP lookup for {} not run: {}", ip, e);
                GeoLocation::unknown()
            }
        }
    }

    #[cfg(test)]
    fn state(&self) -> &State {
        &self.state
    }
}

impl State {
    fn load(&self) -> anyhow::Result<()> {
        let lines = self.log.read_lines().context("reading identity log")?;
        self.records.clear();
        self.index.clear();

        let mut dropped = 0usize;
        for (number, line) in lines.iter().enumerate() {
            let plaintext = match self.cipher.decrypt(line) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("Dropping identity log line {}: {}", number + 1, e);
                    dropped += 1;
                    continue;
                }
            };
            let record = match IdentityRecord::parse_line(&plaintext) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Dropping identity log line {}: {}", number + 1, e);
                    dropped += 1;
                    continue;
                }
            };
            let key = record.key();
            self.index.insert(&key, &record);
            self.records.insert(key, record);
        }

        info!(
            "Loaded {} identity record(s) ({} line(s) dropped)",
            self.records.len(),
            dropped
        );
        Ok(())
    }

    fn find(&self, name: Option<&str>, subject: Option<Uuid>, ip: Option<&str>) -> Option<IdentityRecord> {
        let matches = |record: &IdentityRecord| {
            name.is_none_or(|n| record.name.eq_ignore_ascii_case(n))
                && subject.is_none_or(|s| record.subject == s)
                && ip.is_none_or(|i| record.ip.eq_ignore_ascii_case(i))
        };

        match self.index.candidates(name, subject, ip) {
            Some(keys) => keys
                .iter()
                .filter_map(|key| self.records.get(key).map(|r| r.value().clone()))
                .find(|record| matches(record)),
            None => self
                .records
                .iter()
                .find(|entry| matches(entry.value()))
                .map(|entry| entry.value().clone()),
        }
    }

    /// Primary records for index keys. Keys missing from the primary map are skipped.
    fn resolve(&self, keys: &[String]) -> Vec<IdentityRecord> {
        keys.iter()
            .filter_map(|key| self.records.get(key).map(|r| r.value().clone()))
            .collect()
    }

    fn has_pending_work(&self) -> bool {
        self.rewrite_requested.load(Ordering::Acquire) || !self.pending.lock().is_empty()
    }

    fn is_settled(&self) -> bool {
        !self.flush_scheduled.load(Ordering::Acquire) && !self.has_pending_work()
    }

    /// Single-flight: while a flush runs, later requests only leave work behind
    /// for it to pick up when it finishes.
    fn schedule_flush(self: &Arc<Self>, force_rewrite: bool) {
        if force_rewrite {
            self.rewrite_requested.store(true, Ordering::Release);
        }
        if self
            .flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let state = Arc::clone(self);
        let handle = self.dispatcher.run_async(move || {
            let result = measure(state.metrics.as_deref(), "identity.flush", || state.flush());
            state.flush_scheduled.store(false, Ordering::Release);
            let outcome = match result {
                Ok(()) => {
                    if state.has_pending_work() {
                        state.schedule_flush(false);
                    }
                    Ok(())
                }
                Err(e) => {
                    // Whatever was drained is gone from the queue; only a
                    // full rewrite can restore it.
                    state.rewrite_requested.store(true, Ordering::Release);
                    Err(e)
                }
            };
            state.flushed.notify_waiters();
            outcome
        });
        self.dispatcher.detach(handle, "Identity log flush");
    }

    fn flush(&self) -> anyhow::Result<()> {
        if self.rewrite_requested.swap(false, Ordering::AcqRel) {
            // Drain before the snapshot: a join landing in between is then in
            // the snapshot or still queued for the next append.
            self.pending.lock().clear();
            let snapshot: Vec<IdentityRecord> = self.records.iter().map(|e| e.value().clone()).collect();
            let lines = self.encrypt_all(&snapshot)?;
            self.log.overwrite_lines(&lines).context("rewriting identity log")?;
            debug!("Rewrote identity log with {} record(s)", lines.len());
            return Ok(());
        }

        let batch: Vec<IdentityRecord> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(());
        }
        let lines = self.encrypt_all(&batch)?;
        self.log.append_lines(&lines).context("appending to identity log")?;
        debug!("Appended {} record(s) to identity log", lines.len());
        Ok(())
    }

    fn encrypt_all(&self, records: &[IdentityRecord]) -> anyhow::Result<Vec<String>> {
        records
            .iter()
            .map(|record| self.cipher.encrypt(&record.to_line()).map_err(anyhow::Error::from))
            .collect()
    }
}

fn latest(records: Vec<IdentityRecord>) -> Option<IdentityRecord> {
    records.into_iter().max_by(|a, b| {
        a.last_updated
            .cmp(&b.last_updated)
            .then_with(|| a.ip.cmp(&b.ip))
    })
}

fn ips(mut records: Vec<IdentityRecord>) -> Vec<String> {
    records.sort_by(|a, b| a.last_updated.cmp(&b.last_updated).then_with(|| a.ip.cmp(&b.ip)));
    records.into_iter().map(|r| r.ip).collect()
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("records", &self.state.records.len())
            .field("flush_scheduled", &self.state.flush_scheduled.load(Ordering::Relaxed))
            .finish()
    }
}
