//! Read-through TTL cache over punishment storage.
//!
//! Entries go `absent -> fresh -> stale -> fresh`: a miss or a stale entry
//! loads from storage on the worker pool and installs a new expiry. Freshness
//! is purely TTL-driven; the repeating sweep purges expired punishments in
//! storage and never touches the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{ListingKey, ListingKind, PunishmentRecord, PunishmentType};
use super::store::PunishmentStore;
use crate::BuildError;
use crate::cache::{CacheConfig, CacheEntry, Clock, SystemClock, TypedCache};
use crate::config::CacheSettings;
use crate::dispatch::{HostScheduler, RepeatingTask, TaskDispatcher, TaskError};
use crate::metrics::{MetricsRecorder, measure};

type Records = Vec<PunishmentRecord>;

/// Invalidation generations a load started under. The load installs only if
/// they are unchanged when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Generation {
    all: u64,
    key: u64,
}

/// Why a lookup produced no answer.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// Storage or dispatch failure.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A subject-scoped listing was requested without a subject.
    #[error("{0:?} listing requires a subject")]
    MissingIdentifier(ListingKind),
}

impl LookupError {
    /// Operational failure (show "database error"), as opposed to a bad request.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Task(_))
    }
}

/// TTL cache of active punishments per subject and of paged listings.
///
/// Cloning is cheap; all clones share the same caches and sweep timer.
#[derive(Clone)]
pub struct PunishmentCache {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: TaskDispatcher,
    store: Arc<dyn PunishmentStore>,
    scheduler: Arc<dyn HostScheduler>,
    metrics: Option<Arc<MetricsRecorder>>,
    clock: Arc<dyn Clock>,
    settings: RwLock<CacheSettings>,
    active: RwLock<TypedCache<Uuid, CacheEntry<Records>>>,
    listings: RwLock<TypedCache<ListingKey, CacheEntry<Records>>>,
    /// Bumped when every active entry is dropped.
    active_generation: AtomicU64,
    /// Bumped per subject by `invalidate`.
    subject_generations: DashMap<Uuid, u64>,
    /// Listings are only ever dropped wholesale.
    listing_generation: AtomicU64,
    sweep_task: Mutex<Option<RepeatingTask>>,
}

/// Builder for [`PunishmentCache`].
#[derive(Default)]
pub struct PunishmentCacheBuilder {
    dispatcher: Option<TaskDispatcher>,
    store: Option<Arc<dyn PunishmentStore>>,
    scheduler: Option<Arc<dyn HostScheduler>>,
    metrics: Option<Arc<MetricsRecorder>>,
    clock: Option<Arc<dyn Clock>>,
    settings: CacheSettings,
}

impl PunishmentCacheBuilder {
    pub fn dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn store(mut self, store: Arc<dyn PunishmentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn HostScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Optional: time loads and sweeps.
    pub fn metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Optional: defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the cache and start the expired-punishment sweep.
    pub fn build(self) -> Result<PunishmentCache, BuildError> {
        let dispatcher = self.dispatcher.ok_or(BuildError::Missing("dispatcher"))?;
        let store = self.store.ok_or(BuildError::Missing("punishment store"))?;
        let scheduler = self.scheduler.ok_or(BuildError::Missing("scheduler"))?;
        let settings = self.settings;

        let cache = PunishmentCache {
            inner: Arc::new(Inner {
                dispatcher,
                store,
                scheduler,
                metrics: self.metrics,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                active: RwLock::new(active_cache(settings.active_ttl)),
                listings: RwLock::new(listing_cache(settings.listing_ttl)),
                settings: RwLock::new(settings),
                active_generation: AtomicU64::new(0),
                subject_generations: DashMap::new(),
                listing_generation: AtomicU64::new(0),
                sweep_task: Mutex::new(None),
            }),
        };

        cache.inner.restart_sweep();
        info!(
            "Punishment cache ready (active ttl {:?}, listing ttl {:?})",
            settings.active_ttl, settings.listing_ttl
        );
        Ok(cache)
    }
}

fn active_cache(ttl: Duration) -> TypedCache<Uuid, CacheEntry<Records>> {
    TypedCache::new("active_punishments", CacheConfig::active_punishments(ttl))
}

fn listing_cache(ttl: Duration) -> TypedCache<ListingKey, CacheEntry<Records>> {
    TypedCache::new("punishment_listings", CacheConfig::listings(ttl))
}

impl PunishmentCache {
    pub fn builder() -> PunishmentCacheBuilder {
        PunishmentCacheBuilder::default()
    }

    /// Active punishments of `subject`.
    ///
    /// Served from cache while fresh unless `force_refresh`; otherwise loaded,
    /// filtered to active, and cached.
    pub async fn get(&self, subject: Uuid, force_refresh: bool) -> Result<Records, LookupError> {
        let cache = self.inner.active.read().clone();
        if !force_refresh
            && let Some(records) = cache
                .get(&subject)
                .and_then(|entry| entry.fresh_value(self.inner.clock.now()))
        {
            return Ok(records);
        }

        let ttl = self.inner.settings.read().active_ttl;
        let started = self.inner.active_generation(subject);
        let inner = Arc::clone(&self.inner);

        let records = self
            .inner
            .dispatcher
            .supply_async(move || {
                let loaded = measure(inner.metrics.as_deref(), "punishments.active.fetch", || {
                    inner.store.punishments_for(subject)
                })?;
                let now = Utc::now();
                let active: Records = loaded.into_iter().filter(|r| r.is_active(now)).collect();
                inner.install(&cache, subject, active.clone(), ttl, started, || {
                    inner.active_generation(subject)
                });
                Ok(active)
            })
            .await?;

        debug!("Loaded {} active punishment(s) for {}", records.len(), subject);
        Ok(records)
    }

    /// A memoized page of `kind`.
    pub async fn get_listing(
        &self,
        kind: ListingKind,
        identifier: Option<Uuid>,
        limit: u32,
        offset: u32,
        force_refresh: bool,
    ) -> Result<Records, LookupError> {
        if kind == ListingKind::History && identifier.is_none() {
            return Err(LookupError::MissingIdentifier(kind));
        }

        let key = ListingKey {
            kind,
            identifier,
            limit,
            offset,
        };
        let cache = self.inner.listings.read().clone();
        if !force_refresh
            && let Some(records) = cache
                .get(&key)
                .and_then(|entry| entry.fresh_value(self.inner.clock.now()))
        {
            return Ok(records);
        }

        let ttl = self.inner.settings.read().listing_ttl;
        let started = self.inner.listing_generation();
        let inner = Arc::clone(&self.inner);

        let records = self
            .inner
            .dispatcher
            .supply_async(move || {
                let loaded = measure(inner.metrics.as_deref(), kind.metric_name(), || {
                    inner.load_listing(&key)
                })?;
                inner.install(&cache, key, loaded.clone(), ttl, started, || inner.listing_generation());
                Ok(loaded)
            })
            .await?;
        Ok(records)
    }

    /// Punishment history of `subject`, newest first.
    pub async fn history(
        &self,
        subject: Uuid,
        limit: u32,
        offset: u32,
        force_refresh: bool,
    ) -> Result<Records, LookupError> {
        self.get_listing(ListingKind::History, Some(subject), limit, offset, force_refresh)
            .await
    }

    /// Active ban list, or every ban ever issued when `history_mode`.
    pub async fn ban_list(
        &self,
        history_mode: bool,
        limit: u32,
        offset: u32,
        force_refresh: bool,
    ) -> Result<Records, LookupError> {
        let kind = if history_mode {
            ListingKind::HistoricalBans
        } else {
            ListingKind::ActiveBans
        };
        self.get_listing(kind, None, limit, offset, force_refresh).await
    }

    /// Fresh cached value for `subject`, without loading.
    pub fn cached(&self, subject: Uuid) -> Option<Records> {
        self.inner
            .active
            .read()
            .get(&subject)
            .and_then(|entry| entry.fresh_value(self.inner.clock.now()))
    }

    /// Evict `subject`'s active-punishment entry. Loads for other subjects
    /// are unaffected.
    pub fn invalidate(&self, subject: Uuid) {
        *self.inner.subject_generations.entry(subject).or_insert(0) += 1;
        self.inner.active.read().invalidate(&subject);
    }

    /// Clear both caches.
    pub fn invalidate_all(&self) {
        self.inner.active_generation.fetch_add(1, Ordering::AcqRel);
        self.inner.active.read().invalidate_all();
        self.inner.drop_listings();
    }

    /// Reload `subject` right after a new punishment was written.
    pub async fn warmup(&self, subject: Uuid) -> Result<Records, LookupError> {
        self.get(subject, true).await
    }

    /// Remove punishments in storage, then drop whatever they could have fed.
    pub async fn remove_punishment(
        &self,
        identifier: &str,
        kind: PunishmentType,
        remove_all: bool,
    ) -> Result<usize, LookupError> {
        let inner = Arc::clone(&self.inner);
        let target = identifier.to_string();
        let removed = self
            .inner
            .dispatcher
            .supply_async(move || {
                measure(inner.metrics.as_deref(), "punishments.remove", || {
                    inner.store.remove_punishment(&target, kind, remove_all)
                })
            })
            .await?;

        if let Ok(subject) = Uuid::parse_str(identifier) {
            self.invalidate(subject);
        }
        self.inner.drop_listings();
        Ok(removed)
    }

    /// Apply new TTL/sweep settings.
    ///
    /// A changed TTL replaces the corresponding cache outright, so nothing
    /// computed under the old policy survives. A changed sweep interval
    /// restarts the timer.
    pub fn refresh_configuration(&self, settings: CacheSettings) {
        let previous = std::mem::replace(&mut *self.inner.settings.write(), settings);

        if previous.active_ttl != settings.active_ttl {
            self.inner.active_generation.fetch_add(1, Ordering::AcqRel);
            *self.inner.active.write() = active_cache(settings.active_ttl);
            info!("Active punishment TTL changed to {:?}", settings.active_ttl);
        }

        if previous.listing_ttl != settings.listing_ttl {
            self.inner.listing_generation.fetch_add(1, Ordering::AcqRel);
            *self.inner.listings.write() = listing_cache(settings.listing_ttl);
            info!("Listing TTL changed to {:?}", settings.listing_ttl);
        }

        if previous.cleanup_interval_ticks != settings.cleanup_interval_ticks {
            self.inner.restart_sweep();
        }
    }

    /// Stop the sweep timer.
    pub fn shutdown(&self) {
        self.inner.sweep_task.lock().take();
    }

    /// Purge expired punishments in storage now (what the timer runs).
    pub fn sweep_expired(&self) {
        self.inner.sweep_expired();
    }
}

impl Inner {
    fn active_generation(&self, subject: Uuid) -> Generation {
        Generation {
            all: self.active_generation.load(Ordering::Acquire),
            key: self.subject_generations.get(&subject).map_or(0, |g| *g),
        }
    }

    fn listing_generation(&self) -> Generation {
        Generation {
            all: self.listing_generation.load(Ordering::Acquire),
            key: 0,
        }
    }

    fn drop_listings(&self) {
        self.listing_generation.fetch_add(1, Ordering::AcqRel);
        self.listings.read().invalidate_all();
    }

    /// Install a loaded value unless its key was invalidated while loading.
    ///
    /// Invalidation bumps the generation before evicting, so re-checking after
    /// the insert catches an invalidation that raced the first check.
    fn install<K>(
        &self,
        cache: &TypedCache<K, CacheEntry<Records>>,
        key: K,
        records: Records,
        ttl: Duration,
        started: Generation,
        current: impl Fn() -> Generation,
    ) where
        K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    {
        if current() != started {
            debug!("Cache invalidated during load; not installing result");
            return;
        }
        cache.insert(key.clone(), CacheEntry::new(records, self.clock.now(), ttl));
        if current() != started {
            debug!("Cache invalidated while installing; dropping result");
            cache.invalidate(&key);
        }
    }

    fn load_listing(&self, key: &ListingKey) -> anyhow::Result<Records> {
        match (key.kind, key.identifier) {
            (ListingKind::History, Some(subject)) => self.store.history(subject, key.limit, key.offset),
            (ListingKind::History, None) => Err(anyhow::anyhow!("history listing requires a subject")),
            (ListingKind::ActiveBans, _) => self.store.active_bans(key.limit, key.offset),
            (ListingKind::HistoricalBans, _) => self.store.historical_bans(key.limit, key.offset),
        }
    }

    fn sweep_expired(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let handle = self.dispatcher.run_async(move || {
            let purged = measure(inner.metrics.as_deref(), "punishments.cleanup.expired", || {
                inner.store.purge_expired(Utc::now())
            })?;
            if purged > 0 {
                debug!("Purged {} expired punishment(s)", purged);
            }
            Ok(())
        });
        self.dispatcher.detach(handle, "Expired punishment sweep");
    }

    fn restart_sweep(self: &Arc<Self>) {
        let interval = self.settings.read().cleanup_interval_ticks;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = self.scheduler.schedule_at_fixed_rate(
            interval,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep_expired();
                }
            }),
        );
        *self.sweep_task.lock() = Some(task);
    }
}

impl std::fmt::Debug for PunishmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PunishmentCache")
            .field("settings", &*self.inner.settings.read())
            .field("active", &*self.inner.active.read())
            .field("listings", &*self.inner.listings.read())
            .finish()
    }
}
