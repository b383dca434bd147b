//! Test setup reservation.
//!
//! The result server flags a setup busy for the duration of a run. The
//! manager checks before acquiring, and releases at most once however many
//! teardown paths ask for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StepError;
use crate::sink::{SetupApi, SetupId, SinkError, TeamId};

/// Default interval between polls of [`ReservationManager::acquire_blocking`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_secs(1);

/// Errors raised by reservation operations.
#[derive(Debug, Error)]
pub enum ReservationError {
    /// The setup is in use by someone else.
    #[error("Test setup {setup_id} is busy")]
    Busy {
        /// Requested setup.
        setup_id: SetupId,
    },
    /// The server refused to mark the setup busy.
    #[error("Test setup {setup_id} could not be reserved")]
    Refused {
        /// Requested setup.
        setup_id: SetupId,
    },
    /// The server could not be reached or answered with an error.
    #[error(transparent)]
    Server(#[from] SinkError),
    /// Waiting for the setup was cancelled.
    #[error("waiting for test setup {setup_id} was cancelled")]
    Cancelled {
        /// Requested setup.
        setup_id: SetupId,
    },
}

impl From<ReservationError> for StepError {
    fn from(value: ReservationError) -> Self {
        match value {
            ReservationError::Cancelled { .. } => Self::Cancelled,
            ReservationError::Server(err) => Self::Unexpected(err.to_string()),
            other => Self::TestUsage(other.to_string()),
        }
    }
}

/// Holds the reservation of one setup.
#[derive(Debug)]
pub struct ReservationManager {
    api: Arc<dyn SetupApi>,
    team_id: TeamId,
    setup_id: SetupId,
    external: bool,
    acquired: AtomicBool,
    released: AtomicBool,
    backoff: Duration,
}

impl ReservationManager {
    /// Manager for `setup_id` owned by `team_id`.
    #[must_use]
    pub fn new(api: Arc<dyn SetupApi>, team_id: TeamId, setup_id: SetupId) -> Self {
        Self {
            api,
            team_id,
            setup_id,
            external: false,
            acquired: AtomicBool::new(false),
            released: AtomicBool::new(false),
            backoff: RELEASE_BACKOFF,
        }
    }

    /// Marks the reservation as owned by an outer worker: the setup always
    /// reads as free and acquire/release do nothing.
    #[must_use]
    pub const fn externally_managed(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Overrides the first release retry delay; later retries double it.
    #[must_use]
    pub const fn with_release_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reserved setup.
    #[must_use]
    pub const fn setup_id(&self) -> SetupId {
        self.setup_id
    }

    /// Whether an outer worker owns the reservation.
    #[must_use]
    pub const fn is_external(&self) -> bool {
        self.external
    }

    /// Whether this manager currently holds the setup.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.acquired.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst)
    }

    /// Whether the setup is free.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::Server`] when the server cannot answer.
    pub async fn check_free(&self) -> Result<bool, ReservationError> {
        if self.external {
            return Ok(true);
        }
        Ok(self.api.check_free(self.team_id, self.setup_id).await?)
    }

    /// Checks the setup and marks it busy.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::Busy`] when the setup is taken,
    /// [`ReservationError::Refused`] when the server declines, and
    /// [`ReservationError::Server`] on transport failures.
    pub async fn acquire(&self) -> Result<(), ReservationError> {
        if self.external {
            return Ok(());
        }
        if !self.check_free().await? {
            return Err(ReservationError::Busy {
                setup_id: self.setup_id,
            });
        }
        self.mark_busy().await
    }

    async fn mark_busy(&self) -> Result<(), ReservationError> {
        if !self.api.set_busy(self.team_id, self.setup_id).await? {
            return Err(ReservationError::Refused {
                setup_id: self.setup_id,
            });
        }
        self.released.store(false, Ordering::SeqCst);
        self.acquired.store(true, Ordering::SeqCst);
        info!(setup_id = self.setup_id, "test setup reserved");
        Ok(())
    }

    /// Polls every `poll_interval` until the setup can be acquired.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::Cancelled`] when `cancel` fires, and
    /// server errors as they occur.
    pub async fn acquire_blocking(
        &self,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ReservationError> {
        if self.external {
            return Ok(());
        }
        loop {
            match self.acquire().await {
                Ok(()) => return Ok(()),
                Err(ReservationError::Busy { .. } | ReservationError::Refused { .. }) => {
                    info!(setup_id = self.setup_id, "test setup busy, waiting");
                }
                Err(err) => return Err(err),
            }
            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                () = cancel.cancelled() => {
                    return Err(ReservationError::Cancelled { setup_id: self.setup_id });
                }
            }
        }
    }

    /// Frees the setup if this manager acquired it. Only the first call
    /// talks to the server; it retries with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the last server error once every attempt has failed.
    pub async fn release(&self) -> Result<(), ReservationError> {
        if self.external || !self.acquired.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.api.set_free(self.team_id, self.setup_id).await {
                Ok(true) => {
                    info!(setup_id = self.setup_id, "test setup released");
                    return Ok(());
                }
                Ok(false) => warn!(setup_id = self.setup_id, attempt, "server refused to free setup"),
                Err(err) if attempt >= RELEASE_ATTEMPTS => return Err(err.into()),
                Err(err) => warn!(setup_id = self.setup_id, attempt, error = %err, "release failed"),
            }
            if attempt >= RELEASE_ATTEMPTS {
                return Err(ReservationError::Refused {
                    setup_id: self.setup_id,
                });
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    /// Frees the setup unless it is already free, regardless of who holds
    /// it. Returns whether a free request was sent.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::Server`] on transport failures and
    /// [`ReservationError::Refused`] when the server declines.
    pub async fn force_free(&self) -> Result<bool, ReservationError> {
        if self.api.check_free(self.team_id, self.setup_id).await? {
            return Ok(false);
        }
        if self.api.set_free(self.team_id, self.setup_id).await? {
            Ok(true)
        } else {
            Err(ReservationError::Refused {
                setup_id: self.setup_id,
            })
        }
    }
}
