use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Value as SqlValue;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::record::JobRow;
use crate::types::Job;

/// Key of a cached filtered query: fingerprint of the fully resolved
/// statement plus the generation it was read under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    fingerprint: String,
    generation: u64,
}

/// Per-handle memoization of read queries.
///
/// Filtered queries are keyed by generation, so bumping the generation makes
/// every earlier entry unreachable without touching it. Point lookups by id
/// are kept separately and have to be dropped explicitly.
///
/// Only writes made through the owning handle invalidate entries. A handle
/// shared with other writers must [`QueryCache::reset`] it at the start of
/// every request.
pub struct QueryCache {
    generation: AtomicU64,
    queries: Mutex<HashMap<QueryKey, Vec<JobRow>>>,
    jobs: Mutex<HashMap<i64, Job>>,
    max_entries: usize,
}

impl QueryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            generation: AtomicU64::new(0),
            queries: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advance the generation; returns the new value.
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn key(&self, sql: &str, params: &[SqlValue]) -> QueryKey {
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        for param in params {
            // Tag every value so that e.g. Integer(1) and Text("1") differ.
            match param {
                SqlValue::Null => hasher.update(b"\0n"),
                SqlValue::Integer(i) => {
                    hasher.update(b"\0i");
                    hasher.update(i.to_le_bytes());
                }
                SqlValue::Real(r) => {
                    hasher.update(b"\0r");
                    hasher.update(r.to_le_bytes());
                }
                SqlValue::Text(t) => {
                    hasher.update(b"\0t");
                    hasher.update((t.len() as u64).to_le_bytes());
                    hasher.update(t.as_bytes());
                }
                SqlValue::Blob(b) => {
                    hasher.update(b"\0b");
                    hasher.update((b.len() as u64).to_le_bytes());
                    hasher.update(b);
                }
            }
        }
        QueryKey {
            fingerprint: hex::encode(hasher.finalize()),
            generation: self.generation(),
        }
    }

    pub fn rows(&self, key: &QueryKey) -> Option<Vec<JobRow>> {
        guard(&self.queries).get(key).cloned()
    }

    pub fn store_rows(&self, key: QueryKey, rows: Vec<JobRow>) {
        let current = self.generation();
        // A write landed while the statement ran; the result may already be stale.
        if key.generation != current {
            return;
        }
        let mut queries = guard(&self.queries);
        if queries.len() >= self.max_entries {
            queries.retain(|k, _| k.generation == current);
            if queries.len() >= self.max_entries {
                debug!(entries = queries.len(), "query cache full, clearing");
                queries.clear();
            }
        }
        queries.insert(key, rows);
    }

    pub fn job(&self, id: i64) -> Option<Job> {
        guard(&self.jobs).get(&id).cloned()
    }

    /// Remember a point lookup read under generation `read_at`. Dropped if a
    /// write has happened since, as the write may have touched this job.
    pub fn store_job(&self, job: &Job, read_at: u64) {
        if read_at != self.generation() {
            return;
        }
        let mut jobs = guard(&self.jobs);
        if jobs.len() >= self.max_entries && !jobs.contains_key(&job.id) {
            jobs.clear();
        }
        jobs.insert(job.id, job.clone());
    }

    /// Record a write touching `ids`: new generation, and their point
    /// lookups dropped.
    pub fn invalidate(&self, ids: &[i64]) {
        self.bump();
        let mut jobs = guard(&self.jobs);
        for id in ids {
            jobs.remove(id);
        }
    }

    /// Drop everything, e.g. after the row shape changed.
    pub fn reset(&self) {
        self.bump();
        guard(&self.jobs).clear();
        guard(&self.queries).clear();
    }

    /// Number of filtered-query entries currently held.
    pub fn query_entries(&self) -> usize {
        guard(&self.queries).len()
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
