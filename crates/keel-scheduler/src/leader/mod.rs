//! Leader election.
//!
//! Two layers live here:
//!
//! - [`ElectionService`] / [`ElectionCandidate`]: the contract the scheduler
//!   consumes. A candidate offers itself; the service calls
//!   `start_leadership` once elected and `stop_leadership` once leadership is
//!   lost or abdicated.
//! - [`LeaderElector`]: a lease primitive used by [`LeaseElectionService`].
//!   Leaders hold time-bounded leases and renew them periodically.
//!
//! [`PseudoElectionService`] elects its single candidate immediately and is
//! meant for single-node deployments.

pub mod lease;
pub mod memory;
pub mod pseudo;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use lease::{LeaseElectionConfig, LeaseElectionService};
pub use memory::InMemoryLeaderElector;
pub use pseudo::PseudoElectionService;

/// A participant in leader election.
#[async_trait]
pub trait ElectionCandidate: Send + Sync {
    /// Identity presented to the election backend.
    fn candidate_id(&self) -> &str;

    /// Called once this candidate became leader.
    async fn start_leadership(&self);

    /// Called once this candidate is no longer leader.
    async fn stop_leadership(&self);
}

/// Elects one candidate among the cluster's schedulers.
#[async_trait]
pub trait ElectionService: Send + Sync {
    /// Enters `candidate` into the election.
    async fn offer_leadership(&self, candidate: Arc<dyn ElectionCandidate>);

    /// Gives up leadership. The candidate's `stop_leadership` is called; with
    /// `reoffer` the candidate is entered into the election again.
    ///
    /// `error` marks an abdication caused by a failure.
    async fn abdicate_leadership(&self, error: bool, reoffer: bool);

    /// Returns true while the offered candidate holds leadership.
    fn is_leader(&self) -> bool;
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// The lease was acquired.
    Acquired {
        /// Token required for renewal and release.
        lease_token: String,
        /// Time until the lease expires without renewal.
        lease_duration: Duration,
    },
    /// Another node holds the lease.
    NotLeader {
        /// The current holder, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Returns true if the lease was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    /// Returns the lease token if the lease was acquired.
    #[must_use]
    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// The lease was extended.
    Renewed {
        /// New time until expiry.
        lease_duration: Duration,
    },
    /// The lease expired or was taken over.
    Lost,
    /// The token does not match the current lease.
    InvalidToken,
}

impl RenewalResult {
    /// Returns true if the lease was extended.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Lease-based leadership primitive.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so one elector can serve several services.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Attempts to acquire the lease on `lock_key` for `node_id`.
    ///
    /// A node that already holds a valid lease re-acquires it with a new
    /// token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    async fn try_acquire(&self, lock_key: &str, node_id: &str) -> Result<LeadershipResult>;

    /// Extends a held lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult>;

    /// Releases a held lease. Returns false if the token no longer matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool>;

    /// Returns the node holding a valid lease on `lock_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>>;
}

#[async_trait]
impl<L: LeaderElector + ?Sized> LeaderElector for Arc<L> {
    async fn try_acquire(&self, lock_key: &str, node_id: &str) -> Result<LeadershipResult> {
        (**self).try_acquire(lock_key, node_id).await
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        (**self).renew(lock_key, lease_token).await
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        (**self).release(lock_key, lease_token).await
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        (**self).current_leader(lock_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_result_accessors() {
        let acquired = LeadershipResult::Acquired {
            lease_token: "token".to_string(),
            lease_duration: Duration::from_secs(30),
        };
        assert!(acquired.is_leader());
        assert_eq!(acquired.lease_token(), Some("token"));

        let not_leader = LeadershipResult::NotLeader {
            current_leader: Some("node-b".to_string()),
        };
        assert!(!not_leader.is_leader());
        assert_eq!(not_leader.lease_token(), None);
    }

    #[test]
    fn renewal_result_is_renewed() {
        assert!(
            RenewalResult::Renewed {
                lease_duration: Duration::from_secs(30)
            }
            .is_renewed()
        );
        assert!(!RenewalResult::Lost.is_renewed());
        assert!(!RenewalResult::InvalidToken.is_renewed());
    }
}
