//! Per-session admission control
//!
//! Every forwarded connection must hold an [`AdmissionTicket`]. A ticket stands for one
//! concurrency slot and one consumed rate-limit token; the slot goes back when the
//! ticket is dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use teleport_auth::TierLimits;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::rate_limit::TokenBucket;

/// What the accept loop does once a session hits its concurrency cap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Stop accepting public connections for the rest of the session
    #[default]
    Stop,
    /// Wait until a running connection finishes
    Wait,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Concurrency cap of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("Rate limited, next token in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Session closed")]
    Cancelled,
}

#[derive(Debug)]
struct State {
    active: usize,
    bucket: TokenBucket,
}

/// Concurrency cap plus token bucket for one client session
#[derive(Debug)]
pub struct AdmissionController {
    limits: TierLimits,
    policy: AdmissionPolicy,
    state: Mutex<State>,
    released: Notify,
    cancel: CancellationToken,
}

impl AdmissionController {
    pub fn new(limits: TierLimits, policy: AdmissionPolicy) -> Self {
        Self {
            limits,
            policy,
            state: Mutex::new(State {
                active: 0,
                bucket: TokenBucket::new(limits.max_concurrent, limits.rate_per_second),
            }),
            released: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Fail pending and future admissions once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn limits(&self) -> TierLimits {
        self.limits
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Tickets currently outstanding
    pub fn active(&self) -> usize {
        self.lock_state().active
    }

    /// Stop admitting. Pending [`AdmissionController::admit`] calls return
    /// [`AdmissionError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // State is only counters; a panicked holder cannot leave it half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit one connection without waiting.
    ///
    /// The cap check, the token withdrawal and the increment happen under one lock.
    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionTicket, AdmissionError> {
        if self.cancel.is_cancelled() {
            return Err(AdmissionError::Cancelled);
        }

        let mut state = self.lock_state();
        if state.active >= self.limits.max_concurrent {
            return Err(AdmissionError::CapacityExceeded {
                limit: self.limits.max_concurrent,
            });
        }
        state
            .bucket
            .try_take()
            .map_err(|retry_after| AdmissionError::RateLimited { retry_after })?;
        state.active += 1;
        trace!(active = state.active, "Admitted connection");

        Ok(AdmissionTicket {
            controller: self.clone(),
            released: false,
        })
    }

    /// Admit one connection, waiting for a rate-limit token.
    ///
    /// At the concurrency cap the [`AdmissionPolicy::Stop`] policy returns
    /// [`AdmissionError::CapacityExceeded`] while [`AdmissionPolicy::Wait`] waits for a
    /// ticket to be released. Cancellation ends any wait.
    pub async fn admit(self: &Arc<Self>) -> Result<AdmissionTicket, AdmissionError> {
        loop {
            // Register for release notifications before checking, so a release that
            // lands between the check and the wait is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let wait = match self.try_admit() {
                Ok(ticket) => return Ok(ticket),
                Err(AdmissionError::RateLimited { retry_after }) => Some(retry_after),
                Err(AdmissionError::CapacityExceeded { limit }) => match self.policy {
                    AdmissionPolicy::Stop => return Err(AdmissionError::CapacityExceeded { limit }),
                    AdmissionPolicy::Wait => None,
                },
                Err(e) => return Err(e),
            };

            match wait {
                Some(retry_after) => tokio::select! {
                    _ = tokio::time::sleep(retry_after) => {}
                    _ = self.cancel.cancelled() => return Err(AdmissionError::Cancelled),
                },
                None => tokio::select! {
                    _ = released => {}
                    _ = self.cancel.cancelled() => return Err(AdmissionError::Cancelled),
                },
            }
        }
    }

    fn release(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.active > 0, "ticket released with no active connections");
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.released.notify_waiters();
    }
}

/// One unit of admitted capacity
///
/// Released exactly once: explicitly through [`AdmissionTicket::release`] or on drop.
#[derive(Debug)]
pub struct AdmissionTicket {
    controller: Arc<AdmissionController>,
    released: bool,
}

impl AdmissionTicket {
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release();
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release_once();
    }
}
