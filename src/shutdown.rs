//! Interruption handling.
//!
//! ```text
//! Running -> Draining -> Flushed -> Terminated
//!    \_______________ Flushed(error) -> Terminated(non-zero)
//! ```
//!
//! Workers and the dispatch loop hold a `ShutdownSignal` and stop starting new
//! work once the phase leaves `Running`.

use std::process::ExitCode;

use tokio::sync::watch;
use tracing::{info, warn};

/// Exit status when a second interruption cuts draining short.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Flushed { failed: bool },
    Terminated { failed: bool },
}

impl Phase {
    fn can_move_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Running, Phase::Draining)
                | (Phase::Running, Phase::Flushed { .. })
                | (Phase::Draining, Phase::Flushed { .. })
                | (Phase::Flushed { .. }, Phase::Terminated { .. })
        )
    }
}

/// What an interruption did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// First one: stop dispatching and drain.
    Drain,
    /// Already draining or done: leave now.
    Force,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<Phase>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Phase::Running);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.tx.borrow()
    }

    fn transition(&self, next: Phase) -> bool {
        self.tx.send_if_modified(|phase| {
            if phase.can_move_to(next) {
                *phase = next;
                true
            } else {
                false
            }
        })
    }

    pub fn interrupt(&self) -> Interrupt {
        if self.transition(Phase::Draining) {
            Interrupt::Drain
        } else {
            Interrupt::Force
        }
    }

    /// Records the outcome of the final flush.
    pub fn flushed(&self, failed: bool) -> bool {
        self.transition(Phase::Flushed { failed })
    }

    /// Ends the state machine and returns the process exit code.
    pub fn terminate(&self) -> ExitCode {
        let failed = match self.phase() {
            Phase::Flushed { failed } => failed,
            // Never flushed: treat as a fault.
            Phase::Running | Phase::Draining => {
                self.flushed(true);
                true
            }
            Phase::Terminated { failed } => return exit_code(failed),
        };
        self.transition(Phase::Terminated { failed });
        exit_code(failed)
    }
}

fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Read side handed to every worker.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Phase>,
}

impl ShutdownSignal {
    pub fn is_draining(&self) -> bool {
        *self.rx.borrow() != Phase::Running
    }

    /// Resolves once the phase leaves `Running`. Never resolves if the
    /// coordinator is gone.
    pub async fn draining(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|phase| *phase != Phase::Running).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Feeds SIGINT/SIGTERM into the coordinator. Returns on the second
/// interruption, at which point the caller should exit immediately.
pub async fn watch_signals(coordinator: &ShutdownCoordinator) {
    loop {
        if let Err(e) = next_signal().await {
            warn!(error = %e, "couldn't listen for signals");
            std::future::pending::<()>().await;
        }
        match coordinator.interrupt() {
            Interrupt::Drain => info!("interrupted, finishing in-flight pages and flushing"),
            Interrupt::Force => {
                warn!("interrupted again, exiting without waiting");
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn graceful_path() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        assert!(!signal.is_draining());

        assert_eq!(coordinator.interrupt(), Interrupt::Drain);
        assert!(signal.is_draining());
        assert_eq!(coordinator.phase(), Phase::Draining);
        assert_eq!(coordinator.interrupt(), Interrupt::Force);

        assert!(coordinator.flushed(false));
        assert_eq!(coordinator.terminate(), ExitCode::SUCCESS);
        assert_eq!(coordinator.phase(), Phase::Terminated { failed: false });
    }

    #[test]
    fn fault_path() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.flushed(true));
        // Can't go back to draining.
        assert_eq!(coordinator.interrupt(), Interrupt::Force);
        assert_eq!(coordinator.terminate(), ExitCode::FAILURE);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.transition(Phase::Terminated { failed: false }));
        assert_eq!(coordinator.phase(), Phase::Running);
        assert!(coordinator.flushed(false));
        assert!(!coordinator.flushed(true));
        assert_eq!(coordinator.phase(), Phase::Flushed { failed: false });
    }

    #[test]
    fn terminate_without_flush_fails() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.interrupt();
        assert_eq!(coordinator.terminate(), ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn draining_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        let waiter = tokio::spawn(async move { signal.draining().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        coordinator.interrupt();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
