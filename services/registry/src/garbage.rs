//! Collection of unreferenced blobs.
//!
//! Deletion goes through the log like every other mutation. Only the leader
//! collects, and a blob must stay unreferenced for a grace period first so
//! content uploaded ahead of its manifest survives.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::Registry;
use crate::config::GcConfig;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// What one collection pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    /// Unreferenced blobs seen during the pass.
    pub unreferenced: usize,
    /// Blobs whose deletion committed.
    pub deleted: Vec<Digest>,
    /// Blobs that gained a reference before their deletion applied.
    pub skipped: Vec<Digest>,
}

/// Periodically deletes blobs that have had no references for a while.
#[derive(Debug)]
pub struct GarbageCollector {
    registry: Registry,
    config: GcConfig,
    first_seen: BTreeMap<Digest, Instant>,
}

impl GarbageCollector {
    /// A collector for `registry`.
    pub fn new(registry: Registry, config: GcConfig) -> Self {
        Self {
            registry,
            config,
            first_seen: BTreeMap::new(),
        }
    }

    /// Run one pass: on the leader, propose deletion of every blob that has
    /// been unreferenced for the whole grace period.
    #[tracing::instrument(skip(self), fields(node = self.registry.id()))]
    pub async fn collect_once(&mut self) -> RegistryResult<CollectionReport> {
        let mut report = CollectionReport::default();
        if !self.registry.is_leader() {
            if !self.first_seen.is_empty() {
                debug!("no longer leader, forgetting candidates");
                self.first_seen.clear();
            }
            return Ok(report);
        }

        let now = Instant::now();
        let unreferenced = self.registry.unreferenced_blobs();
        report.unreferenced = unreferenced.len();
        let mut first_seen = BTreeMap::new();
        for digest in unreferenced {
            let seen = self.first_seen.get(&digest).copied().unwrap_or(now);
            first_seen.insert(digest, seen);
        }
        self.first_seen = first_seen;

        let grace_period = self.config.grace_period();
        let due: Vec<Digest> = self
            .first_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= grace_period)
            .map(|(digest, _)| digest.clone())
            .collect();

        for digest in due {
            match self.registry.delete_blob(digest.clone()).await {
                Ok(_) => {
                    debug!(%digest, "blob collected");
                    self.first_seen.remove(&digest);
                    report.deleted.push(digest);
                }
                Err(err @ RegistryError::RefCountNonZero { .. }) => {
                    warn!(%err, "blob referenced again, skipping");
                    self.first_seen.remove(&digest);
                    report.skipped.push(digest);
                }
                Err(err) => {
                    if matches!(err, RegistryError::NotLeader { .. } | RegistryError::NoQuorum) {
                        self.first_seen.clear();
                    }
                    return Err(err);
                }
            }
        }
        Ok(report)
    }

    /// Collect every interval until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => match self.collect_once().await {
                    Ok(report) if !report.deleted.is_empty() || !report.skipped.is_empty() => {
                        info!(
                            deleted = report.deleted.len(),
                            skipped = report.skipped.len(),
                            unreferenced = report.unreferenced,
                            "garbage collection pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "garbage collection pass failed"),
                },
            }
        }
        debug!("garbage collector stopped");
    }
}
