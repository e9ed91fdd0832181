//! Shared health state for the /health endpoint.
//! Updated by the Archiver after every fetch attempt.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Fetch outcome counters. Written by the archiver, read by the API.
#[derive(Default)]
pub struct HealthState {
    /// Unix seconds of the last successful category fetch (0 = none).
    pub last_success_at: AtomicI64,
    /// Unix seconds of the last failed category fetch (0 = none).
    pub last_failure_at: AtomicI64,
    pub fetches_ok: AtomicU64,
    pub fetches_failed: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub fetches_ok: u64,
    pub fetches_failed: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, at_unix: i64) {
        self.last_success_at.store(at_unix, Ordering::Relaxed);
        self.fetches_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, at_unix: i64) {
        self.last_failure_at.store(at_unix, Ordering::Relaxed);
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let nonzero = |v: i64| (v != 0).then_some(v);
        HealthSnapshot {
            last_success_at: nonzero(self.last_success_at.load(Ordering::Relaxed)),
            last_failure_at: nonzero(self.last_failure_at.load(Ordering::Relaxed)),
            fetches_ok: self.fetches_ok.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
        }
    }
}
