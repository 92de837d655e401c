//! Lease based leader election.
//!
//! Every instance runs a [`LeaderElector`] against the same `Lease` object.
//! The holder renews it every `retry_period`; others take it over once
//! `renewTime + leaseDurationMillis` has passed. A holder stops considering
//! itself leader `renew_deadline` after its last successful renewal, which
//! is strictly earlier than anyone else may take over.

use chrono::Utc;
use common::{Lease, LeaseSpec, Object};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::api::{EventSource, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error("invalid leader election timing: {0}")]
    InvalidTiming(String),
    #[error("leader election identity must not be empty")]
    EmptyIdentity,
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderConfig {
    pub fn validate(&self) -> Result<(), LeaderError> {
        if self.identity.is_empty() {
            return Err(LeaderError::EmptyIdentity);
        }
        if self.retry_period.is_zero() {
            return Err(LeaderError::InvalidTiming(
                "retry period must be positive".to_string(),
            ));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(LeaderError::InvalidTiming(format!(
                "retry period {:?} must be shorter than renew deadline {:?}",
                self.retry_period, self.renew_deadline
            )));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(LeaderError::InvalidTiming(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                self.renew_deadline, self.lease_duration
            )));
        }
        Ok(())
    }
}

/// One uninterrupted period of leadership. The token is cancelled as soon
/// as the term ends, whether by loss or by shutdown.
#[derive(Debug, Clone)]
pub struct Term {
    id: u64,
    token: CancellationToken,
}

impl Term {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub async fn lost(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, Clone)]
struct TermState {
    term: Term,
    /// Start of the last successful renewal. `None` never expires.
    renewed: Option<Instant>,
}

/// Read side of leader election handed to the reconciler.
#[derive(Clone)]
pub struct LeaderGate {
    state: watch::Receiver<Option<TermState>>,
    renew_deadline: Option<Duration>,
    closed: CancellationToken,
    // keeps the channel open for gates without an elector
    _holder: Option<Arc<watch::Sender<Option<TermState>>>>,
}

impl LeaderGate {
    /// Gate for a single instance deployment: leadership is held from the
    /// start until `shutdown` fires.
    pub fn always_held(shutdown: &CancellationToken) -> Self {
        let term = Term {
            id: 1,
            token: shutdown.child_token(),
        };
        let (tx, rx) = watch::channel(Some(TermState {
            term,
            renewed: None,
        }));
        Self {
            state: rx,
            renew_deadline: None,
            closed: shutdown.clone(),
            _holder: Some(Arc::new(tx)),
        }
    }

    fn current(&self) -> Option<Term> {
        let state = self.state.borrow();
        let current = state.as_ref()?;
        if !current.term.is_active() {
            return None;
        }
        if let (Some(renewed), Some(deadline)) = (current.renewed, self.renew_deadline)
            && renewed + deadline <= Instant::now()
        {
            return None;
        }
        Some(current.term.clone())
    }

    pub fn is_leader(&self) -> bool {
        self.current().is_some()
    }

    /// The active term, if this instance currently leads.
    pub fn current_term(&self) -> Option<Term> {
        self.current()
    }

    /// Waits until this instance leads. Returns `None` once election stopped.
    pub async fn wait_for_term(&mut self) -> Option<Term> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            if let Some(term) = self.current() {
                return Some(term);
            }
            tokio::select! {
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.closed.cancelled() => return None,
            }
        }
    }
}

pub struct LeaderElector {
    config: LeaderConfig,
    source: EventSource,
    state: watch::Sender<Option<TermState>>,
    closed: CancellationToken,
    /// Last lease copy this instance wrote or read.
    observed: Option<Lease>,
    terms: u64,
}

impl LeaderElector {
    pub fn new(config: LeaderConfig, source: EventSource) -> Result<Self, LeaderError> {
        config.validate()?;
        let (state, _) = watch::channel(None);
        Ok(Self {
            config,
            source,
            state,
            closed: CancellationToken::new(),
            observed: None,
            terms: 0,
        })
    }

    pub fn gate(&self) -> LeaderGate {
        LeaderGate {
            state: self.state.subscribe(),
            renew_deadline: Some(self.config.renew_deadline),
            closed: self.closed.clone(),
            _holder: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Campaigns for the lease until `shutdown` fires, then releases it.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "{} campaigning for lease {}",
            self.config.identity, self.config.lease_name
        );
        while let Some(renewed) = self.acquire(&shutdown).await {
            self.terms += 1;
            let term = Term {
                id: self.terms,
                token: shutdown.child_token(),
            };
            info!(
                "{} became leader of lease {} (term {})",
                self.config.identity, self.config.lease_name, term.id
            );
            self.state.send_replace(Some(TermState {
                term: term.clone(),
                renewed: Some(renewed),
            }));

            let keep = self.renew(&shutdown, renewed).await;
            term.token.cancel();
            self.state.send_replace(None);
            if !keep {
                break;
            }
            info!(
                "{} lost leadership of lease {} (term {})",
                self.config.identity, self.config.lease_name, term.id
            );
        }
        self.release().await;
        self.closed.cancel();
    }

    /// Retries until the lease is ours and returns when the winning attempt
    /// started. Returns `None` on shutdown.
    async fn acquire(&mut self, shutdown: &CancellationToken) -> Option<Instant> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let started = Instant::now();
            match self.try_acquire_or_renew(false).await {
                Ok(true) => return Some(started),
                Ok(false) => debug!(
                    "Lease {} held by {:?}",
                    self.config.lease_name,
                    self.observed.as_ref().and_then(|l| l.holder())
                ),
                Err(e) => warn!("Failed to acquire lease {}: {e}", self.config.lease_name),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keeps renewing. Returns false on shutdown, true once leadership is lost.
    async fn renew(&mut self, shutdown: &CancellationToken, mut renewed: Instant) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = sleep(self.config.retry_period) => {}
            }
            let deadline = renewed + self.config.renew_deadline;
            loop {
                let started = Instant::now();
                match timeout_at(deadline, self.try_acquire_or_renew(true)).await {
                    Ok(Ok(true)) => {
                        renewed = started;
                        self.state.send_modify(|state| {
                            if let Some(state) = state {
                                state.renewed = Some(started);
                            }
                        });
                        break;
                    }
                    Ok(Ok(false)) => return true,
                    Ok(Err(e)) => {
                        warn!("Failed to renew lease {}: {e}", self.config.lease_name);
                    }
                    Err(_) => {
                        warn!(
                            "No renewal of lease {} within {:?}",
                            self.config.lease_name, self.config.renew_deadline
                        );
                        return true;
                    }
                }
                if Instant::now() >= deadline {
                    return true;
                }
                let left = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = sleep(self.config.retry_period.min(left)) => {}
                }
            }
        }
    }

    /// One election round. Ok(false) means someone else holds the lease or
    /// won a race for it. While `renewing`, a lease that changed hands is
    /// never taken back.
    async fn try_acquire_or_renew(&mut self, renewing: bool) -> Result<bool, StoreError> {
        let now = Utc::now();
        let duration_millis = self.config.lease_duration.as_millis() as i64;
        let identity = self.config.identity.clone();

        let Some(mut lease) = self.source.get::<Lease>(&self.config.lease_name).await? else {
            if renewing {
                return Ok(false);
            }
            let lease = Lease::new(
                &self.config.lease_name,
                LeaseSpec {
                    holder_identity: Some(identity),
                    lease_duration_millis: duration_millis,
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_transitions: 0,
                },
            );
            return match self.source.create(&lease).await {
                Ok(stored) => {
                    self.observed = Some(stored);
                    Ok(true)
                }
                Err(e) if e.is_conflict() => Ok(false),
                Err(e) => Err(e),
            };
        };

        let held_by_me = lease.holder() == Some(identity.as_str());
        if !held_by_me && (renewing || !lease.is_expired(now)) {
            self.observed = Some(lease);
            return Ok(false);
        }
        if !held_by_me {
            if let Some(previous) = lease.holder() {
                info!("Lease {} of {previous} expired, taking over", lease.name());
            }
            lease.spec.holder_identity = Some(identity);
            lease.spec.acquire_time = Some(now);
            lease.spec.lease_transitions += 1;
        } else if !renewing {
            lease.spec.acquire_time = Some(now);
        }
        lease.spec.renew_time = Some(now);
        lease.spec.lease_duration_millis = duration_millis;

        match self.source.update(&lease).await {
            Ok(stored) => {
                self.observed = Some(stored);
                Ok(true)
            }
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes the lease if this instance still holds the copy last written.
    async fn release(&mut self) {
        let Some(lease) = self.observed.take() else {
            return;
        };
        if lease.holder() != Some(self.config.identity.as_str()) {
            return;
        }
        match self.source.delete(&lease).await {
            Ok(()) => info!(
                "{} released lease {}",
                self.config.identity, self.config.lease_name
            ),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!("Lease {} changed before release: {e}", self.config.lease_name)
            }
            Err(e) => warn!("Failed to release lease {}: {e}", self.config.lease_name),
        }
    }
}
