//! Claim reconciler.
//!
//! Watch events only carry names into the work queue. Every pass re-reads
//! the claim, its storage class and the derived volume from the store and
//! drives them one step closer to the desired state. All writes are
//! compare-and-swap and are only issued while the pass's leadership term is
//! still active, so a deposed instance never writes on behalf of a newer
//! leader.

use common::{
    ANN_PROVISIONED_BY, ANN_PROVISIONED_VOLUME, ANN_PROVISIONING_FAILED, AccessMode, Object,
    ObjectMeta, ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
    RESOURCE_STORAGE, ReclaimPolicy, StorageClass, VolumePhase, parse_quantity, volume_name_for,
};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::api::{EventSource, ObjectEvent, StoreError, WatchedObject};
use crate::leader::{LeaderGate, Term};
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::volume::{ProvisionError, ProvisionRequest, StrategyRegistry, VolumeSource, VolumeStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stale read; retry at once with fresh state.
    Conflict,
    /// Transient; retry with backoff.
    Retryable,
    /// Needs outside intervention; report and retry slowly.
    Terminal,
    /// This instance no longer leads; drop the item.
    LeadershipLost,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("{0}")]
    Policy(String),
    #[error("leadership lost")]
    LeadershipLost,
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) if e.is_conflict() || e.is_not_found() => ErrorClass::Conflict,
            ReconcileError::Store(_) => ErrorClass::Retryable,
            ReconcileError::Provision(ProvisionError::Retryable(_)) => ErrorClass::Retryable,
            ReconcileError::Provision(ProvisionError::Terminal(_)) => ErrorClass::Terminal,
            ReconcileError::Policy(_) => ErrorClass::Terminal,
            ReconcileError::LeadershipLost => ErrorClass::LeadershipLost,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub workers: usize,
    pub resync_period: Duration,
    /// Lower bound for the retry delay of terminal failures.
    pub terminal_retry: Duration,
    pub backoff: ExponentialBackoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(300),
            terminal_retry: Duration::from_secs(300),
            backoff: ExponentialBackoff::default(),
        }
    }
}

pub struct Controller {
    source: EventSource,
    queue: Arc<WorkQueue<String>>,
    gate: LeaderGate,
    strategies: StrategyRegistry,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        source: EventSource,
        gate: LeaderGate,
        strategies: StrategyRegistry,
        config: ControllerConfig,
    ) -> Self {
        Self {
            source,
            queue: Arc::new(WorkQueue::new(config.backoff)),
            gate,
            strategies,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Runs the watch pump, the resync timers and the worker pool until
    /// `shutdown` fires. In-flight passes finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut provisioners: Vec<_> = self.strategies.names().collect();
        provisioners.sort();
        info!(
            "Starting controller with {} workers for {provisioners:?}",
            self.config.workers
        );

        let pump = tokio::spawn(self.clone().pump(shutdown.clone()));
        let resync = tokio::spawn(self.clone().resync_loop(shutdown.clone()));
        let terms = tokio::spawn(self.clone().term_loop(shutdown.clone()));
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| tokio::spawn(self.clone().worker(id)))
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down controller");
        self.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task failed: {e}");
            }
        }
        for handle in [pump, resync, terms] {
            if let Err(e) = handle.await {
                error!("Controller task failed: {e}");
            }
        }
    }

    async fn pump(self: Arc<Self>, shutdown: CancellationToken) {
        let mut events = self.source.watch();
        let mut claims = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.handle_event(event, &mut claims).await,
                    None => break,
                },
            }
        }
    }

    /// `claims` holds the last seen trigger view of every claim, so that the
    /// failure annotation written by a pass does not schedule another one.
    async fn handle_event(
        &self,
        event: ObjectEvent,
        claims: &mut HashMap<String, PersistentVolumeClaim>,
    ) {
        debug!(
            "{:?} {}/{} at revision {}",
            event.event_type, event.kind, event.name, event.revision
        );
        match event.kind {
            PersistentVolumeClaim::KIND => {
                match event.object {
                    Some(WatchedObject::Claim(claim)) => {
                        let view = trigger_view(claim);
                        if claims.get(&event.name) == Some(&view) {
                            debug!("Claim {} only changed its failure report", event.name);
                            return;
                        }
                        claims.insert(event.name.clone(), view);
                    }
                    _ => {
                        claims.remove(&event.name);
                    }
                }
                self.queue.enqueue(event.name).await
            }
            // a new or fixed class may unblock claims that failed on it
            StorageClass::KIND => match self.source.list::<PersistentVolumeClaim>().await {
                Ok(claims) => {
                    for claim in claims.into_iter().filter(|c| {
                        c.spec.storage_class_name.as_deref() == Some(event.name.as_str())
                            && c.metadata.annotation(ANN_PROVISIONED_VOLUME).is_none()
                    }) {
                        self.queue.enqueue(claim.metadata.name).await;
                    }
                }
                Err(e) => warn!("Failed to list claims of class {}: {e}", event.name),
            },
            _ => {}
        }
    }

    async fn resync_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut timer = interval(self.config.resync_period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately and the term loop covers startup
        timer.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!("Periodic resync failed: {e}");
                    }
                }
            }
        }
    }

    /// Resyncs at the start of every leadership term.
    async fn term_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut gate = self.gate.clone();
        loop {
            let term = tokio::select! {
                _ = shutdown.cancelled() => break,
                term = gate.wait_for_term() => match term {
                    Some(term) => term,
                    None => break,
                },
            };
            info!("Leadership term {} started, resyncing", term.id());
            if let Err(e) = self.resync().await {
                warn!("Resync for term {} failed: {e}", term.id());
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = term.lost() => debug!("Leadership term {} ended", term.id()),
            }
        }
    }

    /// Enqueues every claim and the claim of every volume provisioned here.
    pub async fn resync(&self) -> Result<(), StoreError> {
        let claims = self.source.list::<PersistentVolumeClaim>().await?;
        let volumes = self.source.list::<PersistentVolume>().await?;
        let mut count = 0;
        for claim in claims {
            self.queue.enqueue(claim.metadata.name).await;
            count += 1;
        }
        for volume in volumes {
            let ours = volume
                .metadata
                .annotation(ANN_PROVISIONED_BY)
                .is_some_and(|p| self.strategies.get(p).is_some());
            if ours && let Some(claim) = volume.claim_name() {
                self.queue.enqueue(claim.to_string()).await;
                count += 1;
            }
        }
        debug!("Resync enqueued {count} claims");
        Ok(())
    }

    async fn worker(self: Arc<Self>, id: usize) {
        let mut gate = self.gate.clone();
        debug!("Worker {id} started");
        loop {
            let Some(term) = gate.wait_for_term().await else {
                break;
            };
            let key = tokio::select! {
                key = self.queue.get() => key,
                _ = term.lost() => continue,
            };
            let Some(key) = key else {
                break;
            };
            self.process(key, &term).await;
        }
        debug!("Worker {id} stopped");
    }

    async fn process(&self, key: String, term: &Term) {
        match self.sync_claim(&key, term).await {
            Ok(()) => self.queue.forget(&key).await,
            Err(e) => match e.class() {
                ErrorClass::Conflict => {
                    debug!("Claim {key} changed during sync, requeueing: {e}");
                    self.queue.enqueue(key.clone()).await;
                }
                ErrorClass::Retryable => {
                    let delay = self.queue.enqueue_rate_limited(key.clone()).await;
                    warn!("Failed to sync claim {key}, retrying in {delay:?}: {e}");
                }
                ErrorClass::Terminal => {
                    let delay = self
                        .queue
                        .next_backoff(&key)
                        .await
                        .max(self.config.terminal_retry);
                    error!("Failed to sync claim {key}, retrying in {delay:?}: {e}");
                    self.queue.enqueue_after(key.clone(), delay).await;
                }
                ErrorClass::LeadershipLost => {
                    debug!("Abandoned claim {key} after losing leadership");
                }
            },
        }
        self.queue.done(&key).await;
    }

    fn ensure_leader(&self, term: &Term) -> Result<(), ReconcileError> {
        match self.gate.current_term() {
            Some(current) if current.id() == term.id() && term.is_active() => Ok(()),
            _ => Err(ReconcileError::LeadershipLost),
        }
    }

    /// One reconciliation pass for the claim called `name`.
    pub async fn sync_claim(&self, name: &str, term: &Term) -> Result<(), ReconcileError> {
        self.ensure_leader(term)?;
        let volume_name = volume_name_for(name);
        let claim = self.source.get::<PersistentVolumeClaim>(name).await?;
        let volume = self.source.get::<PersistentVolume>(&volume_name).await?;

        let Some(claim) = claim else {
            return match volume {
                Some(volume) if volume.claim_name() == Some(name) => {
                    self.reclaim(volume, term).await
                }
                _ => {
                    debug!("Claim {name} is gone and has no volume");
                    Ok(())
                }
            };
        };

        if let Some(marked) = claim.metadata.annotation(ANN_PROVISIONED_VOLUME) {
            let exists = if marked == volume_name {
                volume.is_some()
            } else {
                self.source.get::<PersistentVolume>(marked).await?.is_some()
            };
            if exists {
                debug!("Claim {name} already provisioned as {marked}");
                return Ok(());
            }
        }

        let Some(class_name) = claim
            .spec
            .storage_class_name
            .as_deref()
            .filter(|c| !c.is_empty())
        else {
            debug!("Claim {name} has no storage class, skipping");
            return Ok(());
        };

        let result = self
            .provision_claim(&claim, class_name, &volume_name, volume, term)
            .await;
        if let Err(e) = &result
            && e.class() == ErrorClass::Terminal
        {
            self.record_claim_failure(&claim, e, term).await;
        }
        result
    }

    async fn provision_claim(
        &self,
        claim: &PersistentVolumeClaim,
        class_name: &str,
        volume_name: &str,
        volume: Option<PersistentVolume>,
        term: &Term,
    ) -> Result<(), ReconcileError> {
        let Some(class) = self.source.get::<StorageClass>(class_name).await? else {
            return Err(ReconcileError::Policy(format!(
                "storage class {class_name} not found"
            )));
        };
        let Some(strategy) = self.strategies.get(&class.provisioner) else {
            debug!(
                "Claim {} uses provisioner {}, not served here",
                claim.name(),
                class.provisioner
            );
            return Ok(());
        };
        let request = validate_request(claim, &class, strategy.as_ref())?;

        if let Some(existing) = volume {
            let bound_here = existing
                .spec
                .claim_ref
                .as_ref()
                .is_some_and(|r| r.name == claim.name() && r.uid == claim.metadata.uid);
            if !bound_here {
                return Err(ReconcileError::Policy(format!(
                    "volume {volume_name} already exists for another claim generation"
                )));
            }
            // volume written by an earlier pass that died before marking
            return self.mark_claim(claim, volume_name, term).await;
        }

        self.ensure_leader(term)?;
        let source = strategy
            .provision(ProvisionRequest {
                volume_name,
                claim,
                class: &class,
            })
            .await?;

        self.ensure_leader(term)?;
        let volume = build_volume(volume_name, claim, &class, strategy.name(), &request, source);
        self.source.create(&volume).await?;
        info!(
            "Provisioned volume {volume_name} for claim {} ({})",
            claim.name(),
            request.capacity
        );
        self.mark_claim(claim, volume_name, term).await
    }

    async fn mark_claim(
        &self,
        claim: &PersistentVolumeClaim,
        volume_name: &str,
        term: &Term,
    ) -> Result<(), ReconcileError> {
        self.ensure_leader(term)?;
        let mut marked = claim.clone();
        marked
            .metadata
            .annotations
            .insert(ANN_PROVISIONED_VOLUME.to_string(), volume_name.to_string());
        marked.metadata.annotations.remove(ANN_PROVISIONING_FAILED);
        marked.spec.volume_name = Some(volume_name.to_string());
        self.source.update(&marked).await?;
        info!("Bound claim {} to volume {volume_name}", claim.name());
        Ok(())
    }

    /// Best effort: the failure is retried regardless of whether it could be
    /// recorded.
    async fn record_claim_failure(
        &self,
        claim: &PersistentVolumeClaim,
        err: &ReconcileError,
        term: &Term,
    ) {
        let message = err.to_string();
        if claim.metadata.annotation(ANN_PROVISIONING_FAILED) == Some(message.as_str())
            || self.ensure_leader(term).is_err()
        {
            return;
        }
        let mut failed = claim.clone();
        failed
            .metadata
            .annotations
            .insert(ANN_PROVISIONING_FAILED.to_string(), message);
        if let Err(e) = self.source.update(&failed).await {
            debug!("Could not record failure on claim {}: {e}", claim.name());
        }
    }

    /// Applies the reclaim policy of a volume whose claim is gone.
    async fn reclaim(&self, volume: PersistentVolume, term: &Term) -> Result<(), ReconcileError> {
        let provisioner = volume.metadata.annotation(ANN_PROVISIONED_BY).unwrap_or_default();
        let Some(strategy) = self.strategies.get(provisioner) else {
            debug!(
                "Volume {} was not provisioned here ({provisioner:?}), leaving it",
                volume.name()
            );
            return Ok(());
        };

        match volume.spec.persistent_volume_reclaim_policy {
            ReclaimPolicy::Retain => {
                if volume.status.phase == VolumePhase::Released {
                    return Ok(());
                }
                self.ensure_leader(term)?;
                let mut released = volume.clone();
                released.status.phase = VolumePhase::Released;
                released.status.message = Some("claim deleted, volume retained".to_string());
                self.source.update(&released).await?;
                info!("Released volume {} (retained)", volume.name());
                Ok(())
            }
            ReclaimPolicy::Delete => {
                self.ensure_leader(term)?;
                if let Err(e) = strategy.delete(&volume).await {
                    if e.is_terminal() {
                        self.mark_volume_failed(&volume, &e, term).await;
                    }
                    return Err(e.into());
                }
                self.ensure_leader(term)?;
                match self.source.delete(&volume).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                info!("Deleted volume {}", volume.name());
                Ok(())
            }
        }
    }

    async fn mark_volume_failed(&self, volume: &PersistentVolume, err: &ProvisionError, term: &Term) {
        let message = err.to_string();
        if (volume.status.phase == VolumePhase::Failed
            && volume.status.message.as_deref() == Some(message.as_str()))
            || self.ensure_leader(term).is_err()
        {
            return;
        }
        let mut failed = volume.clone();
        failed.status.phase = VolumePhase::Failed;
        failed.status.message = Some(message);
        if let Err(e) = self.source.update(&failed).await {
            debug!("Could not mark volume {} failed: {e}", volume.name());
        }
    }
}

/// The parts of a claim whose change warrants a new pass.
fn trigger_view(mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
    claim.metadata.resource_version = 0;
    claim.metadata.annotations.remove(ANN_PROVISIONING_FAILED);
    claim
}

/// Claim fields checked before any backend work.
struct ValidatedRequest {
    capacity: String,
    reclaim_policy: ReclaimPolicy,
}

fn validate_request(
    claim: &PersistentVolumeClaim,
    class: &StorageClass,
    strategy: &dyn VolumeStrategy,
) -> Result<ValidatedRequest, ReconcileError> {
    let policy = ReconcileError::Policy;

    let reclaim_policy = class
        .reclaim_policy()
        .map_err(|e| policy(format!("storage class {}: {e}", class.name())))?;

    let modes = claim
        .parsed_access_modes()
        .map_err(|e| policy(e.to_string()))?;
    if modes.is_empty() {
        return Err(policy("no access modes requested".to_string()));
    }
    if let Some(mode) = modes
        .iter()
        .copied()
        .find(|m: &AccessMode| !strategy.supports_access_mode(*m))
    {
        return Err(policy(format!(
            "access mode {mode:?} not supported by {}",
            strategy.name()
        )));
    }

    let Some(capacity) = claim.requested_storage() else {
        return Err(policy("no storage size requested".to_string()));
    };
    let bytes = parse_quantity(capacity).map_err(|e| policy(e.to_string()))?;
    if bytes == 0 {
        return Err(policy("requested storage size is zero".to_string()));
    }

    Ok(ValidatedRequest {
        capacity: capacity.to_string(),
        reclaim_policy,
    })
}

fn build_volume(
    volume_name: &str,
    claim: &PersistentVolumeClaim,
    class: &StorageClass,
    provisioner: &str,
    request: &ValidatedRequest,
    source: VolumeSource,
) -> PersistentVolume {
    let mut metadata = ObjectMeta::named(volume_name);
    metadata
        .annotations
        .insert(ANN_PROVISIONED_BY.to_string(), provisioner.to_string());
    let nfs = match source {
        VolumeSource::Nfs(nfs) => Some(nfs),
    };
    let mut volume = PersistentVolume::new(
        metadata,
        PersistentVolumeSpec {
            capacity: HashMap::from([(RESOURCE_STORAGE.to_string(), request.capacity.clone())]),
            access_modes: claim.spec.access_modes.clone(),
            persistent_volume_reclaim_policy: request.reclaim_policy,
            mount_options: class.mount_options.clone(),
            storage_class_name: Some(class.name().to_string()),
            claim_ref: Some(ObjectReference {
                name: claim.name().to_string(),
                uid: claim.metadata.uid.clone(),
            }),
            nfs,
        },
    );
    volume.status.phase = VolumePhase::Bound;
    volume
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::NfsStrategy;
    use common::PersistentVolumeClaimSpec;

    fn claim(modes: &[&str], storage: Option<&str>) -> PersistentVolumeClaim {
        let mut spec = PersistentVolumeClaimSpec {
            access_modes: modes.iter().map(|m| m.to_string()).collect(),
            storage_class_name: Some("standard".to_string()),
            ..Default::default()
        };
        if let Some(storage) = storage {
            spec.resources
                .requests
                .insert(RESOURCE_STORAGE.to_string(), storage.to_string());
        }
        PersistentVolumeClaim::new(ObjectMeta::named("pvc-1"), spec)
    }

    #[test]
    fn test_validate_request() {
        let strategy = NfsStrategy::new("rk8s.io/nfs", "10.0.0.2", "/exports", "/mount");
        let class = StorageClass::new("standard", "rk8s.io/nfs", ReclaimPolicy::Retain);

        let ok = validate_request(&claim(&["ReadWriteMany"], Some("5Gi")), &class, &strategy)
            .unwrap();
        assert_eq!(ok.capacity, "5Gi");
        assert_eq!(ok.reclaim_policy, ReclaimPolicy::Retain);

        for bad in [
            claim(&[], Some("5Gi")),
            claim(&["ReadWriteSometimes"], Some("5Gi")),
            claim(&["ReadWriteOnce"], None),
            claim(&["ReadWriteOnce"], Some("five")),
            claim(&["ReadWriteOnce"], Some("0")),
        ] {
            let err = validate_request(&bad, &class, &strategy).err().unwrap();
            assert_eq!(err.class(), ErrorClass::Terminal, "{err}");
        }

        let mut recycle = class.clone();
        recycle.reclaim_policy = Some("Recycle".to_string());
        assert!(
            validate_request(&claim(&["ReadWriteOnce"], Some("1Gi")), &recycle, &strategy)
                .is_err()
        );
    }

    #[test]
    fn test_failure_report_does_not_change_trigger_view() {
        let original = claim(&["ReadWriteOnce"], Some("1Gi"));
        let mut reported = original.clone();
        reported.metadata.resource_version = 7;
        reported
            .metadata
            .annotations
            .insert(ANN_PROVISIONING_FAILED.to_string(), "no class".to_string());
        assert_eq!(trigger_view(original.clone()), trigger_view(reported));

        let mut marked = original.clone();
        marked
            .metadata
            .annotations
            .insert(ANN_PROVISIONED_VOLUME.to_string(), "pv-pvc-1".to_string());
        assert_ne!(trigger_view(original.clone()), trigger_view(marked));

        let mut resized = original.clone();
        resized
            .spec
            .resources
            .requests
            .insert(RESOURCE_STORAGE.to_string(), "2Gi".to_string());
        assert_ne!(trigger_view(original), trigger_view(resized));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ReconcileError::from(StoreError::Conflict {
                kind: "persistentvolumes",
                name: "pv-pvc-1".to_string()
            })
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            ReconcileError::from(StoreError::WatchClosed).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ReconcileError::from(ProvisionError::Retryable("disk full".into())).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ReconcileError::from(ProvisionError::Terminal("read-only".into())).class(),
            ErrorClass::Terminal
        );
        assert_eq!(
            ReconcileError::LeadershipLost.class(),
            ErrorClass::LeadershipLost
        );
    }
}
