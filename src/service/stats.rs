use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters shared by the provider and the lifecycle manager
#[derive(Debug, Default)]
pub struct ServiceStats {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    files_received: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    // unix millis, 0 when nothing happened yet
    last_activity: AtomicI64,
}

/// Point-in-time copy of [`ServiceStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub active_connections: u64,
    pub files_received: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ServiceStats {
    pub fn connection_accepted(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn file_received(&self, bytes: u64) {
        self.files_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_connections: u64) -> StatsSnapshot {
        let last = self.last_activity.load(Ordering::Relaxed);
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            active_connections,
            files_received: self.files_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: (last > 0)
                .then(|| DateTime::from_timestamp_millis(last))
                .flatten(),
        }
    }
}
