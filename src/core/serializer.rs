//! Per-key FIFO admission lock
//!
//! `AdmissionSerializer` is a fair mutex per account built entirely from
//! atomic scripts on the Shared Fast Store:
//!
//! ```text
//! admit ──► enqueue_and_try_acquire ──true──► Admission
//!                 │ false
//!                 ▼
//!           try_promote_if_head  (every poll_interval, until max_wait)
//!                 │ true                │ deadline / cancelled
//!                 ▼                     ▼
//!             Admission        release_and_promote + Busy
//! ```
//!
//! A lease carries a TTL, so a crashed holder blocks its key for at most one
//! TTL. Release does not hand the lease over; the next waiter discovers it
//! through its own poll. No state is kept in process memory.

use crate::config::LeaseConfig;
use crate::store::{bounded, FastStore};
use crate::types::{AccountKey, DepositError, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A granted admission; pass it back to [`AdmissionSerializer::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Account the lease is held on
    pub account: AccountKey,
    /// Lease holder id, unique per admission attempt
    pub request_id: String,
    /// Time spent waiting in the queue
    pub waited: Duration,
}

/// Per-key FIFO mutex with TTL-bound leases
#[derive(Clone)]
pub struct AdmissionSerializer {
    store: Arc<dyn FastStore>,
    config: LeaseConfig,
}

impl AdmissionSerializer {
    /// Create a serializer over a shared store handle
    ///
    /// # Arguments
    ///
    /// * `store` - Shared Fast Store holding every lease and waiting queue
    /// * `config` - Lease TTL, poll interval, admission ceiling and call timeout
    pub fn new(store: Arc<dyn FastStore>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    /// Lease settings in use
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Take the lease if the key is free and nobody is queued, else join the
    /// tail of the waiting queue
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if `request_id` now holds the lease
    /// * `Ok(false)` if it was queued
    pub async fn enqueue_and_try_acquire(
        &self,
        account: &AccountKey,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        bounded(
            "enqueue_and_try_acquire",
            self.config.store_timeout,
            self.store
                .enqueue_and_try_acquire(account, request_id, self.config.ttl),
        )
        .await
    }

    /// Renew the lease if held, or claim it if `request_id` heads the queue
    /// and the key is free
    pub async fn try_promote_if_head(
        &self,
        account: &AccountKey,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        bounded(
            "try_promote_if_head",
            self.config.store_timeout,
            self.store
                .try_promote_if_head(account, request_id, self.config.ttl),
        )
        .await
    }

    /// Delete the lease if `request_id` owns it and drop `request_id` from the
    /// waiting queue
    ///
    /// Safe to call unconditionally; a non-holder call is a no-op on the lease.
    pub async fn release_and_promote(
        &self,
        account: &AccountKey,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        bounded(
            "release_and_promote",
            self.config.store_timeout,
            self.store.release_and_promote(account, request_id),
        )
        .await
    }

    /// Operational recovery: delete the lease only if `expected_owner` holds it
    pub async fn force_release(
        &self,
        account: &AccountKey,
        expected_owner: &str,
    ) -> Result<bool, StoreError> {
        let released = bounded(
            "force_release",
            self.config.store_timeout,
            self.store.force_release(account, expected_owner),
        )
        .await?;

        if released {
            info!(account = %account, owner = expected_owner, "lease force-released");
        } else {
            warn!(account = %account, owner = expected_owner, "force release skipped, owner mismatch");
        }
        Ok(released)
    }

    /// Poll [`Self::try_promote_if_head`] until admitted, `max_wait` elapses,
    /// or `cancel` fires
    ///
    /// # Returns
    ///
    /// * `Ok(waited)` once `request_id` holds the lease
    /// * `Err(DepositError::Busy)` on timeout or cancellation
    /// * `Err(DepositError::Queue)` if the store fails
    ///
    /// The caller stays in the waiting queue on error; see [`Self::admit`]
    /// for the variant that cleans up.
    pub async fn wait_until_acquired(
        &self,
        account: &AccountKey,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Duration, DepositError> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait;

        loop {
            if self.try_promote_if_head(account, request_id).await? {
                return Ok(started.elapsed());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DepositError::busy(
                    account.as_str(),
                    started.elapsed().as_millis() as u64,
                ));
            }

            let pause = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DepositError::busy(
                        account.as_str(),
                        started.elapsed().as_millis() as u64,
                    ));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Acquire the lease for `account` under a fresh request id, waiting in
    /// FIFO order
    ///
    /// On Busy, cancellation or a store error the request id is removed from
    /// the waiting queue before the error is returned, so an abandoned caller
    /// never blocks later arrivals.
    pub async fn admit(
        &self,
        account: &AccountKey,
        cancel: &CancellationToken,
    ) -> Result<Admission, DepositError> {
        if cancel.is_cancelled() {
            return Err(DepositError::busy(account.as_str(), 0));
        }

        let request_id = Uuid::new_v4().to_string();
        let outcome = match self.enqueue_and_try_acquire(account, &request_id).await {
            Ok(true) => Ok(Duration::ZERO),
            Ok(false) => {
                debug!(account = %account, request_id = %request_id, "queued for admission");
                self.wait_until_acquired(account, &request_id, cancel).await
            }
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(waited) => {
                debug!(
                    account = %account,
                    request_id = %request_id,
                    waited_ms = waited.as_millis() as u64,
                    "admitted"
                );
                Ok(Admission {
                    account: account.clone(),
                    request_id,
                    waited,
                })
            }
            Err(error) => {
                warn!(account = %account, request_id = %request_id, error = %error, "admission abandoned");
                self.abandon(account, &request_id).await;
                Err(error)
            }
        }
    }

    /// Give up a granted admission
    pub async fn release(&self, admission: &Admission) -> Result<bool, StoreError> {
        let released = self
            .release_and_promote(&admission.account, &admission.request_id)
            .await?;
        if !released {
            warn!(
                account = %admission.account,
                request_id = %admission.request_id,
                "lease was no longer held at release, it expired while in use"
            );
        }
        Ok(released)
    }

    async fn abandon(&self, account: &AccountKey, request_id: &str) {
        if let Err(error) = self.release_and_promote(account, request_id).await {
            warn!(
                account = %account,
                request_id,
                error = %error,
                "failed to leave waiting queue, lease TTL will reclaim it"
            );
        }
    }
}
