// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Counters and gauges of the remote build pipeline.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::job::BuildOrigin;

/// Thread-safe counters covering every phase of the pipeline.
///
/// Counters are monotonic; the `current_*` gauges go up when a build starts
/// and back down when it ends, whatever the outcome.
#[derive(Debug, Default)]
pub struct RemoteBuildStats {
    write_success_count: AtomicU64,
    write_failure_count: AtomicU64,
    write_time_ms: AtomicU64,
    build_request_success_count: AtomicU64,
    build_request_failure_count: AtomicU64,
    build_request_time_ms: AtomicU64,
    waiting_time_ms: AtomicU64,
    read_success_count: AtomicU64,
    read_failure_count: AtomicU64,
    read_time_ms: AtomicU64,
    index_build_success_count: AtomicU64,
    index_build_failure_count: AtomicU64,
    current_flush_operations: AtomicI64,
    current_merge_operations: AtomicI64,
    current_flush_size_bytes: AtomicI64,
    current_merge_size_bytes: AtomicI64,
    flush_time_ms: AtomicU64,
    merge_time_ms: AtomicU64,
}

impl RemoteBuildStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write_success(&self, elapsed_ms: u64) {
        self.write_success_count.fetch_add(1, Ordering::Relaxed);
        self.write_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_request_success(&self, elapsed_ms: u64) {
        self.build_request_success_count.fetch_add(1, Ordering::Relaxed);
        self.build_request_time_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_build_request_failure(&self) {
        self.build_request_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_waiting_time(&self, elapsed_ms: u64) {
        self.waiting_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_read_success(&self, elapsed_ms: u64) {
        self.read_success_count.fetch_add(1, Ordering::Relaxed);
        self.read_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_build_success(&self) {
        self.index_build_success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_build_failure(&self) {
        self.index_build_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    /// A build entered the pipeline: bump the in-flight gauges.
    pub fn start_operation(&self, origin: BuildOrigin, size_bytes: u64) {
        if origin.is_flush() {
            self.current_flush_operations.fetch_add(1, Ordering::Relaxed);
            self.current_flush_size_bytes
                .fetch_add(size_bytes as i64, Ordering::Relaxed);
        } else {
            self.current_merge_operations.fetch_add(1, Ordering::Relaxed);
            self.current_merge_size_bytes
                .fetch_add(size_bytes as i64, Ordering::Relaxed);
        }
    }

    /// A build left the pipeline: release the gauges and accumulate the
    /// wall time of the whole operation.
    pub fn end_operation(&self, origin: BuildOrigin, size_bytes: u64, elapsed_ms: u64) {
        if origin.is_flush() {
            self.current_flush_operations.fetch_sub(1, Ordering::Relaxed);
            self.current_flush_size_bytes
                .fetch_sub(size_bytes as i64, Ordering::Relaxed);
            self.flush_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        } else {
            self.current_merge_operations.fetch_sub(1, Ordering::Relaxed);
            self.current_merge_size_bytes
                .fetch_sub(size_bytes as i64, Ordering::Relaxed);
            self.merge_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            write_success_count: self.write_success_count.load(Ordering::Relaxed),
            write_failure_count: self.write_failure_count.load(Ordering::Relaxed),
            write_time_ms: self.write_time_ms.load(Ordering::Relaxed),
            build_request_success_count: self.build_request_success_count.load(Ordering::Relaxed),
            build_request_failure_count: self.build_request_failure_count.load(Ordering::Relaxed),
            build_request_time_ms: self.build_request_time_ms.load(Ordering::Relaxed),
            waiting_time_ms: self.waiting_time_ms.load(Ordering::Relaxed),
            read_success_count: self.read_success_count.load(Ordering::Relaxed),
            read_failure_count: self.read_failure_count.load(Ordering::Relaxed),
            read_time_ms: self.read_time_ms.load(Ordering::Relaxed),
            index_build_success_count: self.index_build_success_count.load(Ordering::Relaxed),
            index_build_failure_count: self.index_build_failure_count.load(Ordering::Relaxed),
            current_flush_operations: self.current_flush_operations.load(Ordering::Relaxed),
            current_merge_operations: self.current_merge_operations.load(Ordering::Relaxed),
            current_flush_size_bytes: self.current_flush_size_bytes.load(Ordering::Relaxed),
            current_merge_size_bytes: self.current_merge_size_bytes.load(Ordering::Relaxed),
            flush_time_ms: self.flush_time_ms.load(Ordering::Relaxed),
            merge_time_ms: self.merge_time_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter, mostly for tests and the stats API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub write_success_count: u64,
    pub write_failure_count: u64,
    pub write_time_ms: u64,
    pub build_request_success_count: u64,
    pub build_request_failure_count: u64,
    pub build_request_time_ms: u64,
    pub waiting_time_ms: u64,
    pub read_success_count: u64,
    pub read_failure_count: u64,
    pub read_time_ms: u64,
    pub index_build_success_count: u64,
    pub index_build_failure_count: u64,
    pub current_flush_operations: i64,
    pub current_merge_operations: i64,
    pub current_flush_size_bytes: i64,
    pub current_merge_size_bytes: i64,
    pub flush_time_ms: u64,
    pub merge_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_balance_out() {
        let stats = RemoteBuildStats::new();
        stats.start_operation(BuildOrigin::Flush, 1024);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.current_flush_operations, 1);
        assert_eq!(snapshot.current_flush_size_bytes, 1024);
        assert_eq!(snapshot.current_merge_operations, 0);

        stats.end_operation(BuildOrigin::Flush, 1024, 7);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.current_flush_operations, 0);
        assert_eq!(snapshot.current_flush_size_bytes, 0);
        assert_eq!(snapshot.flush_time_ms, 7);
        assert_eq!(snapshot.merge_time_ms, 0);
    }

    #[test]
    fn test_merge_attribution() {
        let stats = RemoteBuildStats::new();
        stats.start_operation(BuildOrigin::Merge, 10);
        stats.end_operation(BuildOrigin::Merge, 10, 3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.current_merge_operations, 0);
        assert_eq!(snapshot.merge_time_ms, 3);
        assert_eq!(snapshot.flush_time_ms, 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = RemoteBuildStats::new();
        stats.record_write_success(5);
        stats.record_write_success(6);
        stats.record_write_failure();
        stats.add_waiting_time(100);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.write_success_count, 2);
        assert_eq!(snapshot.write_time_ms, 11);
        assert_eq!(snapshot.write_failure_count, 1);
        assert_eq!(snapshot.waiting_time_ms, 100);
    }
}
