//! Election service built on a [`LeaderElector`] lease.
//!
//! The candidate campaigns for the lease on a fixed lock key. Once acquired,
//! the lease is renewed every `renew_interval`; a failed renewal ends the
//! term (`stop_leadership`) and the campaign resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::{ElectionCandidate, ElectionService, LeaderElector, LeadershipResult};

/// Timing of a [`LeaseElectionService`].
#[derive(Debug, Clone)]
pub struct LeaseElectionConfig {
    /// Key of the lease all candidates compete for.
    pub lock_key: String,
    /// Interval between renewals while leader.
    pub renew_interval: Duration,
    /// Interval between acquisition attempts while follower.
    pub retry_interval: Duration,
}

impl Default for LeaseElectionConfig {
    fn default() -> Self {
        Self {
            lock_key: "keel/scheduler-leader".to_string(),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Campaign {
    candidate: Option<Arc<dyn ElectionCandidate>>,
    cancel: Option<CancellationToken>,
    lease_token: Option<String>,
}

struct Inner<L> {
    elector: L,
    config: LeaseElectionConfig,
    handle: Handle,
    campaign: Mutex<Campaign>,
    leader: AtomicBool,
}

impl<L: LeaderElector + 'static> Inner<L> {
    fn campaign(&self) -> std::sync::MutexGuard<'_, Campaign> {
        self.campaign.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_campaign(self: &Arc<Self>, candidate: Arc<dyn ElectionCandidate>, delay: Duration) {
        let cancel = CancellationToken::new();
        {
            let mut campaign = self.campaign();
            if let Some(previous) = campaign.cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            campaign.candidate = Some(Arc::clone(&candidate));
        }
        let inner = Arc::clone(self);
        self.handle.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            inner.run_campaign(candidate, cancel).await;
        });
    }

    async fn run_campaign(self: Arc<Self>, candidate: Arc<dyn ElectionCandidate>, cancel: CancellationToken) {
        let key = self.config.lock_key.as_str();
        loop {
            match self.elector.try_acquire(key, candidate.candidate_id()).await {
                Ok(LeadershipResult::Acquired { lease_token, .. }) => {
                    if cancel.is_cancelled() {
                        self.release(&lease_token).await;
                        return;
                    }
                    self.campaign().lease_token = Some(lease_token.clone());
                    self.leader.store(true, Ordering::SeqCst);
                    tracing::info!(candidate = candidate.candidate_id(), "lease acquired");

                    let elected = Arc::clone(&candidate);
                    self.handle.spawn(async move {
                        elected.start_leadership().await;
                    });

                    if !self.hold_lease(&lease_token, &cancel).await {
                        return;
                    }
                    self.campaign().lease_token = None;
                    self.leader.store(false, Ordering::SeqCst);
                    candidate.stop_leadership().await;
                }
                Ok(LeadershipResult::NotLeader { current_leader }) => {
                    tracing::debug!(leader = ?current_leader, "lease held elsewhere");
                }
                Err(err) => tracing::warn!(error = %err, "lease acquisition failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    /// Renews until the lease is lost (`true`) or the campaign is cancelled
    /// (`false`).
    async fn hold_lease(&self, lease_token: &str, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(self.config.renew_interval) => {}
            }
            match self.elector.renew(&self.config.lock_key, lease_token).await {
                Ok(result) if result.is_renewed() => {}
                Ok(result) => {
                    tracing::warn!(?result, "lease lost");
                    return true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "lease renewal failed");
                    return true;
                }
            }
        }
    }

    async fn release(&self, lease_token: &str) {
        match self.elector.release(&self.config.lock_key, lease_token).await {
            Ok(released) => tracing::debug!(released, "lease released"),
            Err(err) => tracing::warn!(error = %err, "lease release failed"),
        }
    }
}

/// [`ElectionService`] backed by a lease from a [`LeaderElector`].
pub struct LeaseElectionService<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for LeaseElectionService<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: LeaderElector + 'static> LeaseElectionService<L> {
    /// Creates a service campaigning through `elector` on `handle`.
    #[must_use]
    pub fn new(elector: L, config: LeaseElectionConfig, handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                elector,
                config,
                handle,
                campaign: Mutex::new(Campaign::default()),
                leader: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl<L: LeaderElector + 'static> ElectionService for LeaseElectionService<L> {
    async fn offer_leadership(&self, candidate: Arc<dyn ElectionCandidate>) {
        tracing::info!(candidate = candidate.candidate_id(), "offering leadership");
        self.inner.start_campaign(candidate, Duration::ZERO);
    }

    async fn abdicate_leadership(&self, error: bool, reoffer: bool) {
        let (candidate, cancel, lease_token) = {
            let mut campaign = self.inner.campaign();
            (
                campaign.candidate.clone(),
                campaign.cancel.take(),
                campaign.lease_token.take(),
            )
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let was_leader = self.inner.leader.swap(false, Ordering::SeqCst);
        tracing::info!(error, reoffer, was_leader, "abdicating leadership");

        // The lease is held until the old term is torn down, so no other
        // node starts a term while this one is still running.
        if let Some(candidate) = &candidate {
            candidate.stop_leadership().await;
        }
        if let Some(lease_token) = lease_token {
            self.inner.release(&lease_token).await;
        }
        let Some(candidate) = candidate else {
            return;
        };
        if reoffer {
            self.inner
                .start_campaign(candidate, self.inner.config.retry_interval);
        }
    }

    fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }
}
