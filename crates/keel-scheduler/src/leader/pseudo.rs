//! Single-node election: the offered candidate is always elected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;

use super::{ElectionCandidate, ElectionService};

struct Inner {
    handle: Handle,
    reoffer_delay: Duration,
    candidate: Mutex<Option<Arc<dyn ElectionCandidate>>>,
    leader: AtomicBool,
}

impl Inner {
    fn elect(self: &Arc<Self>, candidate: Arc<dyn ElectionCandidate>) {
        *self.candidate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&candidate));
        self.leader.store(true, Ordering::SeqCst);
        tracing::info!(candidate = candidate.candidate_id(), "elected (single node)");
        self.handle.spawn(async move {
            candidate.start_leadership().await;
        });
    }
}

/// [`ElectionService`] for deployments with a single scheduler.
#[derive(Clone)]
pub struct PseudoElectionService {
    inner: Arc<Inner>,
}

impl PseudoElectionService {
    /// Creates a service spawning candidate callbacks onto `handle`.
    ///
    /// After an abdication with re-offer the candidate is elected again once
    /// `reoffer_delay` has elapsed.
    #[must_use]
    pub fn new(handle: Handle, reoffer_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                reoffer_delay,
                candidate: Mutex::new(None),
                leader: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl ElectionService for PseudoElectionService {
    async fn offer_leadership(&self, candidate: Arc<dyn ElectionCandidate>) {
        self.inner.elect(candidate);
    }

    async fn abdicate_leadership(&self, error: bool, reoffer: bool) {
        let candidate = self
            .inner
            .candidate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(candidate) = candidate else {
            tracing::debug!("abdication without a candidate");
            return;
        };

        let was_leader = self.inner.leader.swap(false, Ordering::SeqCst);
        tracing::info!(error, reoffer, was_leader, "abdicating leadership");
        candidate.stop_leadership().await;

        if reoffer {
            let inner = Arc::clone(&self.inner);
            self.inner.handle.spawn(async move {
                tokio::time::sleep(inner.reoffer_delay).await;
                inner.elect(candidate);
            });
        }
    }

    fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl ElectionCandidate for Counting {
        fn candidate_id(&self) -> &str {
            "node-a"
        }

        async fn start_leadership(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn stop_leadership(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abdication_stops_and_reelects() {
        let election = PseudoElectionService::new(Handle::current(), Duration::from_secs(1));
        let candidate = Arc::new(Counting::default());

        election
            .offer_leadership(Arc::clone(&candidate) as Arc<dyn ElectionCandidate>)
            .await;
        tokio::task::yield_now().await;
        assert!(election.is_leader());
        assert_eq!(candidate.started.load(Ordering::SeqCst), 1);

        election.abdicate_leadership(true, true).await;
        assert!(!election.is_leader());
        assert_eq!(candidate.stopped.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(election.is_leader());
        assert_eq!(candidate.started.load(Ordering::SeqCst), 2);

        election.abdicate_leadership(false, false).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!election.is_leader());
        assert_eq!(candidate.started.load(Ordering::SeqCst), 2);
    }
}
