//! Single-flight coordination of credential refreshes.
//!
//! Without coordination, every request that fails with 401 would start its
//! own refresh, and with rotating refresh credentials the second refresh
//! invalidates the first. The coordinator lets exactly one refresh run per
//! epoch; everyone who asks while it runs awaits the same outcome.
//!
//! The refresh runs on its own task so it settles even if every waiter is
//! dropped. The in-flight record is cleared when that task finishes, and the
//! next 401 starts a new epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use super::ApiError;
use crate::auth::{SessionManager, TokenPair};

/// Result of one refresh epoch, shared by every request that waited on it.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// New credentials are in place.
    Refreshed(TokenPair),
    /// No refresh credential was held, so nothing could be refreshed.
    Skipped,
    /// The refresh failed; the session has been logged out.
    Failed(Arc<ApiError>),
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    epoch: u64,
    outcome: SharedRefresh,
}

pub struct RefreshCoordinator {
    session: Arc<SessionManager>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    epochs: AtomicU64,
}

fn lock_slot(slot: &Mutex<Option<InFlight>>) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RefreshCoordinator {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            in_flight: Arc::new(Mutex::new(None)),
            epochs: AtomicU64::new(0),
        }
    }

    /// Get credentials that replace `rejected_token`.
    ///
    /// If the session already holds a different access token, another
    /// request has refreshed since `rejected_token` was attached and that
    /// token is returned without a new refresh. Otherwise the caller joins
    /// the in-flight refresh, starting one if none is running.
    pub async fn acquire_refreshed_credential(&self, rejected_token: Option<&str>) -> RefreshOutcome {
        let outcome = {
            let mut slot = lock_slot(&self.in_flight);

            if let Some(current) = self.session.access_token() {
                if rejected_token != Some(current.as_str()) {
                    debug!("Access token already rotated, reusing it");
                    return RefreshOutcome::Refreshed(TokenPair {
                        access_token: current,
                        refresh_token: self.session.refresh_token(),
                    });
                }
            }

            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(epoch = in_flight.epoch, "Joining in-flight refresh");
                    in_flight.outcome.clone()
                }
                None => {
                    let in_flight = self.start_refresh();
                    let outcome = in_flight.outcome.clone();
                    *slot = Some(in_flight);
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        lock_slot(&self.in_flight).is_some()
    }

    /// Must be called with the slot locked, so the task cannot clear the
    /// record before it is stored.
    fn start_refresh(&self) -> InFlight {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch = epoch, "Starting refresh epoch");

        let session = self.session.clone();
        let slot = self.in_flight.clone();
        let task = tokio::spawn(async move {
            let outcome = match session.refresh().await {
                Ok(Some(tokens)) => RefreshOutcome::Refreshed(tokens),
                Ok(None) => RefreshOutcome::Skipped,
                Err(e) => RefreshOutcome::Failed(Arc::new(e)),
            };
            let mut slot = lock_slot(&slot);
            if slot.as_ref().map(|f| f.epoch) == Some(epoch) {
                *slot = None;
            }
            outcome
        });

        let outcome = async move {
            task.await.unwrap_or_else(|e| {
                RefreshOutcome::Failed(Arc::new(ApiError::SessionExpired(format!(
                    "Refresh task failed: {}",
                    e
                ))))
            })
        }
        .boxed()
        .shared();

        InFlight { epoch, outcome }
    }
}
