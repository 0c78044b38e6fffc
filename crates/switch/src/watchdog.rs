//! Single-shot receive-timeout timer.
//!
//! The watchdog runs as its own task. `restart` arms it for one deadline,
//! `suspend` disarms it; when the deadline passes without either, exactly
//! one [`Event::Timeout`] is emitted. A timeout delivered concurrently
//! with a `suspend` is possible; the core filters those with its
//! `timeout_plugin` field.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::Event;

enum Command {
    Restart,
    Suspend,
}

/// Handle to the watchdog task. Inert when the configured timeout is zero.
pub(crate) struct Watchdog {
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
}

impl Watchdog {
    /// Spawn the timer task. A zero `timeout` disables the watchdog
    /// entirely and no task is spawned.
    pub(crate) fn spawn(
        timeout: Duration,
        event_tx: mpsc::UnboundedSender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        if timeout.is_zero() {
            return Self { cmd_tx: None };
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(timeout, cmd_rx, event_tx, cancel));
        Self {
            cmd_tx: Some(cmd_tx),
        }
    }

    /// Arm the timer for one full timeout period, replacing any pending
    /// deadline.
    pub(crate) fn restart(&self) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::Restart);
        }
    }

    /// Disarm the timer.
    pub(crate) fn suspend(&self) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::Suspend);
        }
    }
}

async fn run(
    timeout: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    debug!(timeout_ms = timeout.as_millis() as u64, "watchdog started");
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Restart) => {
                    trace!("watchdog restarted");
                    deadline = Some(Instant::now() + timeout);
                }
                Some(Command::Suspend) => {
                    trace!("watchdog suspended");
                    deadline = None;
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debug!("receive timeout expired");
                deadline = None;
                if event_tx.send(Event::Timeout).is_err() {
                    break;
                }
            }
        }
    }
    debug!("watchdog terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let dog = Watchdog::spawn(
            Duration::from_millis(100),
            event_tx,
            CancellationToken::new(),
        );

        dog.restart();
        let event = event_rx.recv().await.unwrap();
        assert_eq!(event, Event::Timeout);

        // One-shot: no second event without a restart.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_prevents_delivery() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let dog = Watchdog::spawn(
            Duration::from_millis(100),
            event_tx,
            CancellationToken::new(),
        );

        dog.restart();
        tokio::time::sleep(Duration::from_millis(50)).await;
        dog.suspend();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_deadline() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let dog = Watchdog::spawn(
            Duration::from_millis(100),
            event_tx,
            CancellationToken::new(),
        );

        dog.restart();
        tokio::time::sleep(Duration::from_millis(80)).await;
        dog.restart();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(event_rx.try_recv().is_err());

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event, Event::Timeout);
    }

    #[tokio::test]
    async fn test_disabled_watchdog_is_inert() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let dog = Watchdog::spawn(Duration::ZERO, event_tx, CancellationToken::new());
        dog.restart();
        dog.suspend();
        assert!(event_rx.try_recv().is_err());
    }
}
