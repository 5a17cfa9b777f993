//! Partition Tracker
//!
//! Maps each hosting executor to the result partitions it currently holds,
//! so partitions can be released when an executor disconnects or a job
//! ends.
//!
//! ## Responsibilities
//!
//! - `start_tracking_partition`: record that a host holds a partition,
//!   including whether local resources (spill files) live on that host
//! - `stop_tracking_partitions_for`: an executor is gone; every partition
//!   it hosted is handed to the registered release callback
//! - **Promotion**: a partition may be marked to outlive its owning job
//!   (cluster partition). Promoted partitions are tracked separately so
//!   normal job-teardown cleanup does not remove them.
//!
//! ## Release callback
//!
//! The callback is an external collaborator (typically the shuffle master
//! issuing release calls to executors). The tracker never touches
//! partition data itself.

use std::collections::HashMap;
use std::sync::Arc;

use gridflow_core::ResultPartitionId;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// What the tracker knows about one hosted partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionTrackerEntry {
    pub partition_id: ResultPartitionId,
    /// Whether the host holds local resources (e.g. spill files) that need
    /// explicit release.
    pub has_local_resources: bool,
}

/// Invoked with the partitions that should be released on a host.
pub type ReleaseCallback = Arc<dyn Fn(&str, Vec<ResultPartitionId>) + Send + Sync>;

#[derive(Default)]
struct Inner {
    /// Job-scoped partitions per host.
    by_host: HashMap<String, HashMap<ResultPartitionId, PartitionTrackerEntry>>,
    /// Promoted (cluster-wide) partitions per host; survive job teardown.
    cluster_by_host: HashMap<String, HashMap<ResultPartitionId, PartitionTrackerEntry>>,
}

/// Tracks which executor hosts which result partitions.
pub struct PartitionTracker {
    inner: RwLock<Inner>,
    release_callback: ReleaseCallback,
}

impl PartitionTracker {
    pub fn new(release_callback: ReleaseCallback) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            release_callback,
        }
    }

    /// Record that `host` holds a partition.
    pub async fn start_tracking_partition(&self, host: &str, entry: PartitionTrackerEntry) {
        let mut inner = self.inner.write().await;
        debug!(host, partition = %entry.partition_id, "tracking partition");
        inner
            .by_host
            .entry(host.to_string())
            .or_default()
            .insert(entry.partition_id, entry);
    }

    /// Stop tracking one partition without releasing it (e.g. it was fully
    /// consumed). Returns whether it was tracked.
    pub async fn stop_tracking_partition(
        &self,
        host: &str,
        partition_id: ResultPartitionId,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(partitions) = inner.by_host.get_mut(host) else {
            return false;
        };
        let removed = partitions.remove(&partition_id).is_some();
        if partitions.is_empty() {
            inner.by_host.remove(host);
        }
        removed
    }

    /// An executor is lost or a job is tearing down: schedule everything it
    /// hosted for release. Promoted partitions are untouched. Returns the
    /// released partition ids.
    pub async fn stop_tracking_partitions_for(&self, host: &str) -> Vec<ResultPartitionId> {
        let released: Vec<ResultPartitionId> = {
            let mut inner = self.inner.write().await;
            inner
                .by_host
                .remove(host)
                .map(|partitions| partitions.into_keys().collect())
                .unwrap_or_default()
        };
        if !released.is_empty() {
            info!(host, count = released.len(), "releasing partitions for host");
            (self.release_callback)(host, released.clone());
        }
        released
    }

    pub async fn is_tracking_partitions_for(&self, host: &str) -> bool {
        let inner = self.inner.read().await;
        inner.by_host.contains_key(host) || inner.cluster_by_host.contains_key(host)
    }

    /// Promote partitions to cluster scope so job teardown leaves them in
    /// place. Unknown ids are ignored.
    pub async fn promote_partitions(&self, host: &str, partition_ids: &[ResultPartitionId]) {
        let mut inner = self.inner.write().await;
        let Some(partitions) = inner.by_host.get_mut(host) else {
            return;
        };
        let mut promoted = Vec::new();
        for id in partition_ids {
            if let Some(entry) = partitions.remove(id) {
                promoted.push(entry);
            }
        }
        if partitions.is_empty() {
            inner.by_host.remove(host);
        }
        if promoted.is_empty() {
            return;
        }
        debug!(host, count = promoted.len(), "promoted partitions to cluster scope");
        let cluster = inner.cluster_by_host.entry(host.to_string()).or_default();
        for entry in promoted {
            cluster.insert(entry.partition_id, entry);
        }
    }

    /// Cluster-scoped partitions currently recorded for a host.
    pub async fn get_cluster_partitions(&self, host: &str) -> Vec<ResultPartitionId> {
        let inner = self.inner.read().await;
        inner
            .cluster_by_host
            .get(host)
            .map(|partitions| partitions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Explicitly release a host's cluster-scoped partitions (cluster
    /// shutdown or data expiry).
    pub async fn release_cluster_partitions_for(&self, host: &str) -> Vec<ResultPartitionId> {
        let released: Vec<ResultPartitionId> = {
            let mut inner = self.inner.write().await;
            inner
                .cluster_by_host
                .remove(host)
                .map(|partitions| partitions.into_keys().collect())
                .unwrap_or_default()
        };
        if !released.is_empty() {
            (self.release_callback)(host, released.clone());
        }
        released
    }

    /// Hosts with any tracked partitions, in no particular order.
    pub async fn tracked_hosts(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut hosts: Vec<String> = inner
            .by_host
            .keys()
            .chain(inner.cluster_by_host.keys())
            .cloned()
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Released = Arc<Mutex<Vec<(String, Vec<ResultPartitionId>)>>>;

    fn tracker_with_log() -> (PartitionTracker, Released) {
        let released: Released = Arc::new(Mutex::new(Vec::new()));
        let log = released.clone();
        let tracker = PartitionTracker::new(Arc::new(move |host: &str, ids| {
            log.lock().unwrap().push((host.to_string(), ids));
        }));
        (tracker, released)
    }

    fn entry() -> PartitionTrackerEntry {
        PartitionTrackerEntry {
            partition_id: ResultPartitionId::new(),
            has_local_resources: true,
        }
    }

    #[tokio::test]
    async fn test_start_and_query_tracking() {
        let (tracker, _) = tracker_with_log();
        assert!(!tracker.is_tracking_partitions_for("exec-1").await);

        tracker.start_tracking_partition("exec-1", entry()).await;
        assert!(tracker.is_tracking_partitions_for("exec-1").await);
        assert!(!tracker.is_tracking_partitions_for("exec-2").await);
    }

    #[tokio::test]
    async fn test_stop_tracking_releases_via_callback() {
        let (tracker, released) = tracker_with_log();
        let a = entry();
        let b = entry();
        tracker.start_tracking_partition("exec-1", a).await;
        tracker.start_tracking_partition("exec-1", b).await;
        tracker.start_tracking_partition("exec-2", entry()).await;

        let ids = tracker.stop_tracking_partitions_for("exec-1").await;
        assert_eq!(ids.len(), 2);
        assert!(!tracker.is_tracking_partitions_for("exec-1").await);
        assert!(tracker.is_tracking_partitions_for("exec-2").await);

        let log = released.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "exec-1");
        let mut callback_ids = log[0].1.clone();
        callback_ids.sort();
        let mut expected = vec![a.partition_id, b.partition_id];
        expected.sort();
        assert_eq!(callback_ids, expected);
    }

    #[tokio::test]
    async fn test_stop_tracking_unknown_host_is_silent() {
        let (tracker, released) = tracker_with_log();
        let ids = tracker.stop_tracking_partitions_for("nobody").await;
        assert!(ids.is_empty());
        assert!(released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_tracking_single_partition_no_callback() {
        let (tracker, released) = tracker_with_log();
        let e = entry();
        tracker.start_tracking_partition("exec-1", e).await;

        assert!(tracker.stop_tracking_partition("exec-1", e.partition_id).await);
        assert!(!tracker.stop_tracking_partition("exec-1", e.partition_id).await);
        assert!(!tracker.is_tracking_partitions_for("exec-1").await);
        assert!(released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_survives_job_teardown() {
        let (tracker, released) = tracker_with_log();
        let promoted = entry();
        let normal = entry();
        tracker.start_tracking_partition("exec-1", promoted).await;
        tracker.start_tracking_partition("exec-1", normal).await;

        tracker
            .promote_partitions("exec-1", &[promoted.partition_id])
            .await;

        // Job teardown releases only the non-promoted partition.
        let ids = tracker.stop_tracking_partitions_for("exec-1").await;
        assert_eq!(ids, vec![normal.partition_id]);
        assert_eq!(
            tracker.get_cluster_partitions("exec-1").await,
            vec![promoted.partition_id]
        );
        // Host is still tracked through its cluster partition.
        assert!(tracker.is_tracking_partitions_for("exec-1").await);

        // Explicit cluster release does go through the callback.
        let cluster_ids = tracker.release_cluster_partitions_for("exec-1").await;
        assert_eq!(cluster_ids, vec![promoted.partition_id]);
        assert!(!tracker.is_tracking_partitions_for("exec-1").await);
        assert_eq!(released.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_promote_unknown_ids_ignored() {
        let (tracker, _) = tracker_with_log();
        tracker
            .promote_partitions("exec-1", &[ResultPartitionId::new()])
            .await;
        assert!(tracker.get_cluster_partitions("exec-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_tracked_hosts() {
        let (tracker, _) = tracker_with_log();
        tracker.start_tracking_partition("exec-b", entry()).await;
        tracker.start_tracking_partition("exec-a", entry()).await;
        assert_eq!(tracker.tracked_hosts().await, vec!["exec-a", "exec-b"]);
    }
}
