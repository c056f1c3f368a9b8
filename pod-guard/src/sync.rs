use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use pod_guard_common::EnforcementFlag;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::bpf::{BpfMap, EnforcementTable};
use crate::config::PodSelector;
use crate::identity::{IdentitySnapshot, IdentityTable, PodIdentity};
use crate::kubernetes::{PodSource, running_identities};
use crate::metrics::SyncMetrics;

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub node: String,
    pub selector: PodSelector,
    pub block: bool,
    pub prune_stale: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub version: u64,
    pub monitored: usize,
    pub write_failures: usize,
    pub pruned: usize,
}

/// Periodically rebuilds the identity snapshot and the enforcement table from
/// the pods currently running on the node.
pub struct Synchronizer<P, M>
where
    P: PodSource,
    M: BpfMap<u32, u8>,
{
    pods: P,
    table: EnforcementTable<M>,
    identities: IdentityTable,
    settings: SyncSettings,
    // addresses that may still have an entry in the table, tracked only
    // when pruning
    installed: HashSet<Ipv4Addr>,
    metrics: SyncMetrics,
}

impl<P, M> Synchronizer<P, M>
where
    P: PodSource,
    M: BpfMap<u32, u8>,
{
    pub fn new(
        pods: P,
        table: EnforcementTable<M>,
        identities: IdentityTable,
        settings: SyncSettings,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            pods,
            table,
            identities,
            settings,
            installed: HashSet::new(),
            metrics,
        }
    }

    fn flag(&self) -> EnforcementFlag {
        EnforcementFlag::from_block_mode(self.settings.block)
    }

    /// Runs one cycle. A failed pod query leaves the published snapshot and
    /// the table untouched.
    pub async fn sync_once(&mut self) -> Result<SyncReport> {
        let pods = match self
            .pods
            .list_pods(&self.settings.node, &self.settings.selector)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                self.metrics.failures.inc();
                return Err(e);
            }
        };

        let snapshot =
            IdentitySnapshot::from_identities(running_identities(&pods, &self.settings.selector));
        let selected: Vec<PodIdentity> = snapshot.sorted().into_iter().cloned().collect();
        let version = self.identities.publish(snapshot);

        let flag = self.flag();
        let mut report = SyncReport {
            version,
            monitored: selected.len(),
            ..Default::default()
        };
        for pod in &selected {
            match self.table.write(pod.address, flag) {
                Ok(key) => {
                    debug!(
                        "added pod {} ({}) key 0x{key:08x} in {flag} mode",
                        pod.name, pod.address
                    );
                    if self.settings.prune_stale {
                        self.installed.insert(pod.address);
                    }
                }
                Err(e) => {
                    warn!(%e, "failed to write entry for pod {} ({})", pod.name, pod.address);
                    self.metrics.write_failures.inc();
                    report.write_failures += 1;
                }
            }
        }

        if self.settings.prune_stale {
            report.pruned = self.prune(&selected);
        }

        self.metrics.cycles.inc();
        self.metrics.monitored_pods.set(report.monitored as i64);
        info!(
            "now monitoring {} pod(s) - block mode: {}",
            report.monitored, self.settings.block
        );
        Ok(report)
    }

    // Failed removals stay in `installed` and are retried next cycle.
    fn prune(&mut self, selected: &[PodIdentity]) -> usize {
        let current: HashSet<Ipv4Addr> = selected.iter().map(|p| p.address).collect();
        let stale: Vec<Ipv4Addr> = self.installed.difference(&current).copied().collect();

        let mut pruned = 0;
        for address in stale {
            match self.table.remove(address) {
                Ok(()) => {
                    debug!("removed stale entry for {address}");
                    self.installed.remove(&address);
                    pruned += 1;
                }
                Err(e) => warn!(%e, "failed to remove stale entry for {address}"),
            }
        }
        pruned
    }

    pub async fn run(mut self, period: Duration, cancel: CancellationToken) -> Result<()> {
        info!(
            "starting policy synchronizer for node {} with selector {:?}",
            self.settings.node,
            self.settings.selector.to_string()
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!(%e, "failed to list pods, keeping previous state");
                    }
                }
            }
        }

        info!("policy synchronizer stopped");
        Ok(())
    }
}
