//! Short-lived performance profiles captured around optimisation stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::cache::{CacheConfig, TypedCache};
use crate::dispatch::{TaskDispatcher, TaskHandle};

/// When a profile was taken relative to the change being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureType {
    Before,
    After,
    Runtime,
}

/// One captured profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSnapshot {
    pub stage: String,
    pub capture_type: CaptureType,
    pub tps: f64,
    pub command_latency_millis: f64,
    pub captured_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub sequence: u64,
}

/// Before/after comparison for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileComparison {
    pub stage: String,
    pub before: ProfileSnapshot,
    pub after: ProfileSnapshot,
    pub tps_gain: f64,
    pub command_latency_delta: f64,
}

/// Stores the latest snapshot per (stage, capture type) for ten minutes.
#[derive(Clone)]
pub struct ProfileRepository {
    dispatcher: TaskDispatcher,
    cache: TypedCache<(String, CaptureType), ProfileSnapshot>,
    sequence: Arc<AtomicU64>,
}

impl ProfileRepository {
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        Self::with_config(dispatcher, CacheConfig::profiles())
    }

    pub fn with_config(dispatcher: TaskDispatcher, config: CacheConfig) -> Self {
        Self {
            dispatcher,
            cache: TypedCache::new("performance_profiles", config),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a profile off the confined thread.
    pub fn record_async(
        &self,
        stage: &str,
        capture_type: CaptureType,
        tps: f64,
        command_latency_millis: f64,
        notes: Option<String>,
    ) -> TaskHandle<ProfileSnapshot> {
        let cache = self.cache.clone();
        let sequence = Arc::clone(&self.sequence);
        let stage = stage.to_string();

        self.dispatcher.supply_async(move || {
            let snapshot = ProfileSnapshot {
                stage: stage.clone(),
                capture_type,
                tps,
                command_latency_millis,
                captured_at: Utc::now(),
                notes,
                sequence: sequence.fetch_add(1, Ordering::AcqRel) + 1,
            };
            cache.insert((stage, capture_type), snapshot.clone());
            Ok(snapshot)
        })
    }

    pub fn snapshot(&self, stage: &str, capture_type: CaptureType) -> Option<ProfileSnapshot> {
        self.cache.get(&(stage.to_string(), capture_type))
    }

    /// Compare BEFORE and AFTER for a stage; `None` unless both exist.
    pub fn summarize(&self, stage: &str) -> Option<ProfileComparison> {
        let before = self.snapshot(stage, CaptureType::Before)?;
        let after = self.snapshot(stage, CaptureType::After)?;
        Some(ProfileComparison {
            stage: stage.to_string(),
            tps_gain: after.tps - before.tps,
            command_latency_delta: after.command_latency_millis - before.command_latency_millis,
            before,
            after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ConfinedThread;

    #[tokio::test]
    async fn summarize_needs_both_captures() {
        let confined = Arc::new(ConfinedThread::spawn("test-profiles").unwrap());
        let dispatcher = TaskDispatcher::with_pool_size(confined, 2).unwrap();
        let profiles = ProfileRepository::new(dispatcher.clone());

        let before = profiles
            .record_async("index-rebuild", CaptureType::Before, 18.5, 12.0, None)
            .await
            .unwrap();
        assert_eq!(before.sequence, 1);
        assert!(profiles.summarize("index-rebuild").is_none());

        let after = profiles
            .record_async("index-rebuild", CaptureType::After, 19.9, 4.5, Some("warm".into()))
            .await
            .unwrap();
        assert_eq!(after.sequence, 2);

        let comparison = profiles.summarize("index-rebuild").unwrap();
        assert!((comparison.tps_gain - 1.4).abs() < 1e-9);
        assert!((comparison.command_latency_delta + 7.5).abs() < 1e-9);
        dispatcher.close();
    }
}
