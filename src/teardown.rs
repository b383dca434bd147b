//! Teardown shared by the normal exit path and the signal handler.
//!
//! Whichever path gets here first closes the devices and releases the
//! setup; the other waits for it to finish and then finds nothing to do.

use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::registry::DeviceRegistry;
use crate::reservation::{ReservationError, ReservationManager};

/// Termination signals the runner handles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TermSignal {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl TermSignal {
    /// Process exit code reported after the signal.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }

    /// Conventional signal name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

/// Installed SIGINT and SIGTERM handlers.
///
/// Once installed, the default disposition stays replaced for the life of
/// the process, so signals after the first are ignored.
#[derive(Debug)]
pub struct SignalListener {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalListener {
    /// Installs the handlers. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the OS error when a handler cannot be registered.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next termination signal.
    pub async fn recv(&mut self) -> TermSignal {
        tokio::select! {
            _ = self.interrupt.recv() => TermSignal::Interrupt,
            _ = self.terminate.recv() => TermSignal::Terminate,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resources to give back when the process stops, in reverse acquisition
/// order: devices first, then the reservation.
#[derive(Debug)]
pub struct Teardown {
    cancel: CancellationToken,
    reservation: Mutex<Option<Arc<ReservationManager>>>,
    registry: Mutex<Option<Arc<DeviceRegistry>>>,
    running: tokio::sync::Mutex<()>,
    signal: OnceLock<TermSignal>,
}

impl Teardown {
    /// Teardown that cancels `cancel` when a signal arrives.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            reservation: Mutex::new(None),
            registry: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
            signal: OnceLock::new(),
        }
    }

    /// Run-wide cancellation token.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Registers the held reservation.
    pub fn attach_reservation(&self, reservation: Arc<ReservationManager>) {
        *lock(&self.reservation) = Some(reservation);
    }

    /// Registers the opened devices.
    pub fn attach_registry(&self, registry: Arc<DeviceRegistry>) {
        *lock(&self.registry) = Some(registry);
    }

    /// Signal received so far, if any.
    #[must_use]
    pub fn signal(&self) -> Option<TermSignal> {
        self.signal.get().copied()
    }

    /// Closes the devices and releases the reservation. Later calls wait
    /// for an in-flight teardown and then return without doing anything.
    ///
    /// # Errors
    ///
    /// Returns the release error once every retry has failed.
    pub async fn run(&self) -> Result<(), ReservationError> {
        let _running = self.running.lock().await;
        let registry = lock(&self.registry).take();
        if let Some(devices) = registry {
            devices.close_all().await;
        }
        let reservation = lock(&self.reservation).take();
        let Some(held) = reservation else {
            return Ok(());
        };
        held.release().await
    }

    /// Handles a termination signal: cancels the run, tears down and
    /// returns the exit code to report.
    pub async fn on_signal(&self, received: TermSignal) -> i32 {
        if self.signal.set(received).is_err() {
            warn!(signal = received.name(), "signal ignored, teardown already in progress");
            return self.signal().unwrap_or(received).exit_code();
        }
        info!(signal = received.name(), "stopping run");
        self.cancel.cancel();
        if let Err(err) = self.run().await {
            error!(error = %err, "teardown after signal failed");
        }
        received.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::device::{DeviceType, PortPool};
    use crate::test_support::{FakeSetupApi, ScriptedConnection, scripted_device};

    async fn held(api: &Arc<FakeSetupApi>) -> Arc<ReservationManager> {
        let reservation = Arc::new(ReservationManager::new(Arc::clone(api) as _, 1, 9));
        reservation.acquire().await.expect("acquired");
        reservation
    }

    fn devices(conn: &Arc<ScriptedConnection>) -> Arc<DeviceRegistry> {
        Arc::new(
            DeviceRegistry::new(
                vec![scripted_device(1, DeviceType::RadioNode, Arc::clone(conn))],
                Arc::new(PortPool::new()),
            )
            .expect("registry"),
        )
    }

    #[rstest]
    #[case(TermSignal::Interrupt, 130)]
    #[case(TermSignal::Terminate, 143)]
    fn signals_map_to_exit_codes(#[case] received: TermSignal, #[case] code: i32) {
        assert_eq!(received.exit_code(), code);
    }

    #[tokio::test]
    async fn teardown_closes_devices_then_releases_once() {
        let api = Arc::new(FakeSetupApi::new());
        let conn = Arc::new(ScriptedConnection::new("dut"));
        let teardown = Teardown::new(CancellationToken::new());
        teardown.attach_reservation(held(&api).await);
        teardown.attach_registry(devices(&conn));

        teardown.run().await.expect("teardown");
        teardown.run().await.expect("second teardown is a no-op");
        assert_eq!(api.free_calls(), 1);
        assert_eq!(conn.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_and_normal_exit_release_exactly_once() {
        let api = Arc::new(FakeSetupApi::new());
        api.fail_free_times(1);
        let teardown = Arc::new(Teardown::new(CancellationToken::new()));
        teardown.attach_reservation(held(&api).await);

        let normal = {
            let shared = Arc::clone(&teardown);
            tokio::spawn(async move { shared.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let code = teardown.on_signal(TermSignal::Terminate).await;
        normal.await.expect("join").expect("released after one retry");

        assert_eq!(code, 143);
        assert!(teardown.cancel_token().is_cancelled());
        assert_eq!(api.free_calls(), 2);
        assert_eq!(teardown.signal(), Some(TermSignal::Terminate));
    }

    #[tokio::test]
    async fn second_signal_keeps_the_first_exit_code() {
        let teardown = Teardown::new(CancellationToken::new());
        assert_eq!(teardown.on_signal(TermSignal::Interrupt).await, 130);
        assert_eq!(teardown.on_signal(TermSignal::Terminate).await, 130);
    }
}
