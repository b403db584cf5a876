use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Instant,
};

use super::ProviderKey;

/// What has been learned about one provider/model pair.
///
/// Returned by value from [`RateLimitController::learned_limit`]; mutating the copy has no
/// effect on the controller.
///
/// [`RateLimitController::learned_limit`]: super::RateLimitController::learned_limit
#[derive(Clone, Debug, PartialEq)]
pub struct LearnedLimitRecord {
    /// Current learned ceiling, always within `1..=original_limit`.
    pub concurrency: usize,
    /// Ceiling that recovery restores.
    pub original_limit: usize,
    /// Rejections since the last success.
    pub consecutive_429_count: u32,
    /// Rejections since the record was created or last reset.
    pub total_429_count: u64,
    /// Rejection timestamps, oldest first, bounded by the configured history capacity.
    pub historical_429s: VecDeque<Instant>,
    /// Set while the ceiling is below `original_limit` and a recovery step is pending.
    pub recovery_scheduled: bool,
    /// When recovery last stepped the ceiling up.
    pub last_recovery_at: Option<Instant>,
    pub(crate) recovery_armed_at: Option<Instant>,
}

impl LearnedLimitRecord {
    pub(crate) fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            concurrency: limit,
            original_limit: limit,
            consecutive_429_count: 0,
            total_429_count: 0,
            historical_429s: VecDeque::new(),
            recovery_scheduled: false,
            last_recovery_at: None,
            recovery_armed_at: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.concurrency < self.original_limit
    }

    pub(crate) fn push_rejection(&mut self, at: Instant, capacity: usize) {
        self.historical_429s.push_back(at);
        while self.historical_429s.len() > capacity.max(1) {
            self.historical_429s.pop_front();
        }
    }

    pub(crate) fn reset(&mut self, original_limit: usize) {
        *self = Self::new(original_limit);
    }
}

type SharedRecord = Arc<Mutex<LearnedLimitRecord>>;

/// Learned limits keyed by [`ProviderKey`].
///
/// The map lock is only held long enough to find or insert an entry; every record has
/// its own mutex so updates to one key never wait on another key.
#[derive(Debug, Default)]
pub(crate) struct LearnedLimitStore {
    records: RwLock<HashMap<ProviderKey, SharedRecord>>,
}

impl LearnedLimitStore {
    pub(crate) fn get(&self, key: &ProviderKey) -> Option<SharedRecord> {
        read(&self.records).get(key).cloned()
    }

    pub(crate) fn get_or_insert_with(
        &self,
        key: &ProviderKey,
        init: impl FnOnce() -> LearnedLimitRecord,
    ) -> SharedRecord {
        if let Some(record) = self.get(key) {
            return record;
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub(crate) fn snapshot(&self, key: &ProviderKey) -> Option<LearnedLimitRecord> {
        self.get(key).map(|record| lock(&record).clone())
    }

    pub(crate) fn entries(&self) -> Vec<(ProviderKey, SharedRecord)> {
        read(&self.records)
            .iter()
            .map(|(key, record)| (key.clone(), Arc::clone(record)))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn len(&self) -> usize {
        read(&self.records).len()
    }
}

pub(crate) fn lock(record: &Mutex<LearnedLimitRecord>) -> MutexGuard<'_, LearnedLimitRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}
