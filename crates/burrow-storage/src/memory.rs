use async_trait::async_trait;
use burrow_core::error::StorageError;
use burrow_core::store::{MappingRecord, NewMapping, ReadStore, Result, Store};
use burrow_core::ShortCode;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    records: DashMap<ShortCode, MappingRecord>,
    ids: DashMap<i64, ShortCode>,
    next_id: AtomicI64,
    offline: AtomicBool,
    // Serializes batch flushes so one batch is applied as a unit.
    batch_lock: Mutex<()>,
}

/// In-memory implementation of the durable store using DashMap.
///
/// Used by unit tests and single-process runs. The short code map's entry
/// API gives the same insert-if-absent guarantee as a unique index.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored mappings.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Makes every subsequent call fail with [`StorageError::Unavailable`]
    /// until switched back, to exercise outage handling.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadStore for InMemoryStore {
    async fn get_by_code(&self, code: &ShortCode) -> Result<Option<MappingRecord>> {
        self.check_online()?;
        Ok(self.inner.records.get(code).map(|r| r.value().clone()))
    }

    async fn get_by_url(&self, original_url: &str) -> Result<Option<MappingRecord>> {
        self.check_online()?;
        Ok(self
            .inner
            .records
            .iter()
            .filter(|r| r.original_url == original_url)
            .max_by_key(|r| (r.created_at, r.id))
            .map(|r| r.value().clone()))
    }

    async fn exists(&self, code: &ShortCode) -> Result<bool> {
        self.check_online()?;
        Ok(self.inner.records.contains_key(code))
    }

    async fn most_clicked(&self, limit: usize) -> Result<Vec<MappingRecord>> {
        self.check_online()?;
        let mut records: Vec<MappingRecord> = self
            .inner
            .records
            .iter()
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.click_count
                .cmp(&a.click_count)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_if_absent(&self, mapping: &NewMapping) -> Result<i64> {
        self.check_online()?;

        match self.inner.records.entry(mapping.short_code.clone()) {
            Entry::Occupied(_) => Err(StorageError::Conflict(mapping.short_code.to_string())),
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                slot.insert(mapping.clone().into_record(id));
                self.inner.ids.insert(id, mapping.short_code.clone());
                Ok(id)
            }
        }
    }

    async fn increment_clicks(&self, id: i64) -> Result<i64> {
        self.check_online()?;

        let code = self
            .inner
            .ids
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StorageError::NotFound(format!("id {id}")))?;

        let mut record = self
            .inner
            .records
            .get_mut(&code)
            .ok_or_else(|| StorageError::NotFound(format!("id {id}")))?;
        record.click_count += 1;
        Ok(record.click_count)
    }

    async fn batch_increment_clicks(&self, increments: &HashMap<ShortCode, u64>) -> Result<()> {
        self.check_online()?;

        let _guard = self
            .inner
            .batch_lock
            .lock()
            .map_err(|_| StorageError::Operation("batch lock poisoned".to_string()))?;

        // Validate every amount before touching any record.
        let mut planned = Vec::with_capacity(increments.len());
        for (code, amount) in increments {
            let amount = i64::try_from(*amount).map_err(|e| {
                StorageError::InvalidData(format!("increment for '{code}' out of range: {e}"))
            })?;
            planned.push((code, amount));
        }

        for (code, amount) in planned {
            if let Some(mut record) = self.inner.records.get_mut(code) {
                record.click_count += amount;
            }
        }
        Ok(())
    }
}
