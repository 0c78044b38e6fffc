//! Per-input session executor.
//!
//! Each input runs in its own task that drives the plugin through start /
//! receive / stop sessions and owns the input's packet ring. Commands from
//! the core are non-blocking: start and stop are pending-request counters
//! (not booleans) so that overlapping commands during a rapid switch are
//! all preserved and answered one-for-one; the counters are drained to
//! zero each round.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use ts::{PacketMetadata, TsPacket};

use crate::events::Event;
use crate::plugin::InputPlugin;
use crate::ring::PacketRing;

struct ExecState {
    ring: PacketRing,
    /// When true, a full ring blocks the writer; when false, the oldest
    /// packets are overwritten.
    flow_control: bool,
    start_requests: usize,
    stop_requests: usize,
    /// Cancels the in-flight receive of the current session.
    session_abort: CancellationToken,
}

struct ExecShared {
    state: Mutex<ExecState>,
    /// Signaled whenever there is something for the session task to look
    /// at: a request, freed ring space, a released output borrow.
    todo: Notify,
    terminate: CancellationToken,
}

/// Handle to one input session task.
pub(crate) struct InputExecutor {
    index: usize,
    shared: Arc<ExecShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl InputExecutor {
    /// Spawn the session task for one input plugin.
    pub(crate) fn spawn(
        index: usize,
        plugin: Box<dyn InputPlugin>,
        ring_capacity: usize,
        max_input_packets: usize,
        receive_timeout: Duration,
        event_tx: mpsc::UnboundedSender<Event>,
        terminate: CancellationToken,
    ) -> Self {
        let shared = Arc::new(ExecShared {
            state: Mutex::new(ExecState {
                ring: PacketRing::new(ring_capacity),
                flow_control: false,
                start_requests: 0,
                stop_requests: 0,
                session_abort: CancellationToken::new(),
            }),
            todo: Notify::new(),
            terminate,
        });
        let join = tokio::spawn(run(
            index,
            plugin,
            Arc::clone(&shared),
            event_tx,
            max_input_packets,
            receive_timeout,
        ));
        Self {
            index,
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    /// Post a start request with the flow-control policy for the session.
    pub(crate) fn start_input(&self, flow_control: bool) {
        debug!(index = self.index, flow_control, "received start request");
        {
            let mut state = self.shared.state.lock().unwrap();
            state.flow_control = flow_control;
            state.start_requests += 1;
        }
        self.shared.todo.notify_one();
    }

    /// Post a stop request. With `abort`, the in-flight receive is
    /// cancelled so a blocked plugin unblocks immediately.
    pub(crate) fn stop_input(&self, abort: bool) {
        debug!(index = self.index, abort, "received stop request");
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop_requests += 1;
            if abort {
                state.session_abort.cancel();
            }
        }
        self.shared.todo.notify_one();
    }

    /// Update the flow-control policy of the running session.
    pub(crate) fn set_flow_control(&self, flow_control: bool) {
        self.shared.state.lock().unwrap().flow_control = flow_control;
    }

    /// Request termination of the executor task.
    pub(crate) fn terminate_input(&self) {
        self.shared.terminate.cancel();
        self.shared.todo.notify_one();
    }

    /// Borrow the readable span of this input's ring for the output side.
    pub(crate) fn reserve_read(&self) -> Option<(Vec<TsPacket>, Vec<PacketMetadata>)> {
        let area = self.shared.state.lock().unwrap().ring.reserve_read();
        self.shared.todo.notify_one();
        area
    }

    /// Release packets of a previously borrowed range after sending.
    pub(crate) fn release_read(&self, count: usize) {
        self.shared.state.lock().unwrap().ring.release_read(count);
        self.shared.todo.notify_one();
    }

    /// Wait for the session task to exit.
    pub(crate) async fn wait_for_termination(&self) {
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// Session task body. Each iteration of the outer loop is one complete
/// input session.
async fn run(
    index: usize,
    mut plugin: Box<dyn InputPlugin>,
    shared: Arc<ExecShared>,
    event_tx: mpsc::UnboundedSender<Event>,
    max_input_packets: usize,
    receive_timeout: Duration,
) {
    debug!(index, plugin = plugin.name(), "input executor started");

    // Success of the last start and stop operations.
    let mut start_status = false;
    let mut stop_status = false;

    'executor: loop {
        // Session gate: notify pending stops (we are already stopped),
        // wait for a start request, start the plugin, notify the starts.
        while !shared.terminate.is_cancelled() && !start_status {
            let (start_count, stop_count) = loop {
                let notified = shared.todo.notified();
                {
                    let mut state = shared.state.lock().unwrap();
                    state.ring.reset();
                    if state.start_requests > 0
                        || state.stop_requests > 0
                        || shared.terminate.is_cancelled()
                    {
                        break (state.start_requests, state.stop_requests);
                    }
                }
                notified.await;
            };
            debug!(index, start_count, stop_count, "processing session requests");

            for _ in 0..stop_count {
                let _ = event_tx.send(Event::InputStopped {
                    index,
                    ok: stop_status,
                });
            }

            if !shared.terminate.is_cancelled() && start_count > 0 {
                debug!(index, "starting input plugin");
                start_status = match plugin.start().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(index, error = %e, "input plugin failed to start");
                        false
                    }
                };
                for _ in 0..start_count {
                    let _ = event_tx.send(Event::InputStarted {
                        index,
                        ok: start_status,
                    });
                }
            }

            let mut state = shared.state.lock().unwrap();
            state.start_requests -= start_count;
            state.stop_requests -= stop_count;
        }

        if shared.terminate.is_cancelled() {
            break 'executor;
        }

        // One input session: loop on incoming packets until it ends.
        let session_abort = {
            let mut state = shared.state.lock().unwrap();
            state.session_abort = CancellationToken::new();
            state.session_abort.clone()
        };
        let mut packets = vec![TsPacket::NULL; max_input_packets];
        let mut metadata = vec![PacketMetadata::default(); max_input_packets];

        'session: loop {
            // Wait for free ring space, overwriting the oldest packets
            // when flow control is off.
            let (first, room) = loop {
                let notified = shared.todo.notified();
                {
                    let mut state = shared.state.lock().unwrap();
                    if state.stop_requests > 0 || shared.terminate.is_cancelled() {
                        break 'session;
                    }
                    if !state.ring.is_full() {
                        break state.ring.reserve_write(max_input_packets);
                    }
                    if !state.flow_control && state.ring.overwrite_oldest(max_input_packets) > 0 {
                        continue;
                    }
                    // Flow control, or the output still holds the oldest
                    // packets: wait for the reader to free space.
                }
                notified.await;
            };

            for meta in &mut metadata[..room] {
                meta.reset();
            }

            let received = tokio::select! {
                biased;
                _ = shared.terminate.cancelled() => break 'session,
                _ = session_abort.cancelled() => {
                    debug!(index, "input receive aborted");
                    // The abort came with a stop request; the loop head
                    // picks it up.
                    continue 'session;
                }
                result = receive_with_timeout(
                    plugin.as_mut(),
                    &mut packets[..room],
                    &mut metadata[..room],
                    receive_timeout,
                ) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(index, error = %e, "input receive failed");
                        0
                    }
                }
            };

            if received == 0 {
                // End of input, handled as a stop request.
                debug!(index, "end of input");
                shared.state.lock().unwrap().stop_requests += 1;
                break 'session;
            }
            // A plugin may never return more than it was offered.
            let received = received.min(room);
            trace!(index, received, "packets received");

            {
                let mut state = shared.state.lock().unwrap();
                state.ring.commit_write(first, &packets[..received], &metadata[..received]);
            }
            let _ = event_tx.send(Event::InputReceived { index });
        }

        // In case of a normal end of input, wait for all output to be
        // drained; in any case wait for the output to release its borrow.
        loop {
            let notified = shared.todo.notified();
            {
                let mut state = shared.state.lock().unwrap();
                if !state.ring.output_in_use()
                    && (state.ring.is_empty()
                        || state.stop_requests > 0
                        || shared.terminate.is_cancelled())
                {
                    state.ring.reset();
                    break;
                }
            }
            debug!(index, "session ended, waiting for the output to release the buffer");
            notified.await;
        }

        debug!(index, "stopping input plugin");
        stop_status = match plugin.stop().await {
            Ok(()) => true,
            Err(e) => {
                warn!(index, error = %e, "input plugin failed to stop");
                false
            }
        };
        start_status = false;
        // The stop notifications are emitted at the top of the next
        // iteration.
    }

    debug!(index, "input executor terminated");
}

/// Receive from the plugin, bounded by the configured receive timeout. A
/// timed-out receive reads as an end of input, which ends the session and
/// lets the core fail over.
async fn receive_with_timeout(
    plugin: &mut dyn InputPlugin,
    packets: &mut [TsPacket],
    metadata: &mut [PacketMetadata],
    receive_timeout: Duration,
) -> crate::Result<usize> {
    if receive_timeout.is_zero() {
        plugin.receive(packets, metadata).await
    } else {
        match tokio::time::timeout(receive_timeout, plugin.receive(packets, metadata)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("input receive timed out");
                Ok(0)
            }
        }
    }
}
