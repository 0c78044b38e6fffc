/// Events reported to the core by input executors and the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// An input session start completed, successfully or not.
    InputStarted { index: usize, ok: bool },
    /// An input committed packets to its ring.
    InputReceived { index: usize },
    /// An input session stopped, successfully or not.
    InputStopped { index: usize, ok: bool },
    /// The receive timeout elapsed without being re-armed.
    Timeout,
}
