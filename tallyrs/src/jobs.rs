//! Materialization lifecycle shared by rollups and the optimized source.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::TableStats;
use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Pending,
    Building,
    Ready,
    Stale,
    Error,
}

/// Status and statistics of the last materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BuildState {
    pub status: BuildStatus,
    pub row_count: Option<u64>,
    pub size_bytes: Option<u64>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_refresh_error: Option<String>,
}

impl BuildState {
    pub fn is_ready(&self) -> bool {
        self.status == BuildStatus::Ready
    }

    pub fn mark_building(&mut self) {
        self.status = BuildStatus::Building;
    }

    pub fn mark_ready(&mut self, stats: TableStats) {
        self.status = BuildStatus::Ready;
        self.row_count = Some(stats.row_count);
        self.size_bytes = stats.size_bytes;
        self.last_refresh_at = Some(Utc::now());
        self.last_refresh_error = None;
    }

    /// Record a failed build; row counts still describe the previous table.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = BuildStatus::Error;
        self.last_refresh_error = Some(message.into());
    }

    pub fn mark_stale(&mut self) {
        if self.status != BuildStatus::Pending {
            self.status = BuildStatus::Stale;
        }
    }
}

/// Ids with a refresh in flight. At most one refresh per id runs at a time.
#[derive(Debug, Clone, Default)]
pub struct RefreshJobs {
    running: Arc<Mutex<HashSet<String>>>,
}

impl RefreshJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`; the claim is released when the guard drops, including when
    /// the refresh future is cancelled.
    pub fn try_start(&self, key: impl Into<String>) -> Result<RefreshGuard> {
        let key = key.into();
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(key.clone()) {
            return Err(TallyError::RefreshInProgress(key));
        }
        Ok(RefreshGuard {
            key,
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

#[derive(Debug)]
pub struct RefreshGuard {
    key: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_refresh_of_same_id_is_rejected() {
        let jobs = RefreshJobs::new();
        let guard = jobs.try_start("rollup:daily").unwrap();
        assert!(matches!(
            jobs.try_start("rollup:daily"),
            Err(TallyError::RefreshInProgress(_))
        ));
        assert!(jobs.try_start("rollup:weekly").is_ok());
        drop(guard);
        assert!(!jobs.is_running("rollup:daily"));
        assert!(jobs.try_start("rollup:daily").is_ok());
    }

    #[test]
    fn failure_keeps_previous_stats() {
        let mut state = BuildState::default();
        state.mark_ready(TableStats {
            row_count: 10,
            size_bytes: Some(1024),
        });
        state.mark_failed("boom");
        assert_eq!(state.status, BuildStatus::Error);
        assert_eq!(state.row_count, Some(10));
        assert_eq!(state.last_refresh_error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_definitions_do_not_become_stale() {
        let mut state = BuildState::default();
        state.mark_stale();
        assert_eq!(state.status, BuildStatus::Pending);
    }
}
