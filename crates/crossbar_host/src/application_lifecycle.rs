//! Shutdown of the crossbar daemon.
//!
//! The IPC server and the file watcher run until the daemon goes down. They await `recv_exit()`, usually through
//! `loop_select_exiting!`. Plugin schedules are not tied to this, they are cancelled by the scheduler itself.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tokio::sync::broadcast;

/// Why the daemon is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ExitReason {
    /// SIGINT or SIGTERM.
    #[strum(serialize = "received signal")]
    Signal,
    /// `crossbar-host kill`.
    #[strum(serialize = "received kill command")]
    KillCommand,
}

static EXIT_SENDER: Lazy<broadcast::Sender<ExitReason>> = Lazy::new(|| broadcast::channel(2).0);

/// Tell all long running tasks that the daemon is shutting down. Fails if no task is listening.
pub fn send_exit(reason: ExitReason) -> Result<()> {
    log::debug!("Daemon shutting down: {}", reason);
    EXIT_SENDER.send(reason).context("Failed to send exit lifecycle event")?;
    Ok(())
}

/// Resolves once the daemon shuts down. Only exits sent after this was first polled are seen.
pub async fn recv_exit() -> Result<ExitReason> {
    EXIT_SENDER.subscribe().recv().await.context("Failed to receive lifecycle event")
}

/// Select in a loop, breaking once the daemon shuts down (see `crate::application_lifecycle`).
#[macro_export]
macro_rules! loop_select_exiting {
    ($($content:tt)*) => {
        loop {
            tokio::select! {
                Ok(_) = $crate::application_lifecycle::recv_exit() => {
                    break;
                }
                $($content)*
            }
        }
    };
}
