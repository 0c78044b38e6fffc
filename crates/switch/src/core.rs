//! Global switching state machine.
//!
//! The core tracks the current and next input, applies the switching
//! strategy, wires the watchdog to the selected input and reacts to
//! session events from the input executors. It owns no packet buffers,
//! only index references into the executors.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use ts::{PacketMetadata, TsPacket};

use crate::events::Event;
use crate::input::InputExecutor;
use crate::options::{Strategy, SwitchOptions};
use crate::output::OutputExecutor;
use crate::plugin::{InputPlugin, OutputPlugin};
use crate::watchdog::Watchdog;
use crate::{Result, SwitchError};

/// State of the core object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreState {
    Stopped,
    StartingNext,
    Running,
    StoppingPrevious,
}

/// State of one input, as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Input switching direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Downward,
    Unchanged,
    Upward,
}

/// Core fields protected by the global mutex.
struct CoreShared {
    state: CoreState,
    /// Index of the current input.
    cur_plugin: usize,
    /// Next input during a switching phase, same as `cur_plugin` when
    /// stable.
    next_plugin: usize,
    /// Input the watchdog currently monitors; also the spurious-timeout
    /// filter.
    timeout_plugin: Option<usize>,
    /// Number of completed cycles through all inputs.
    cur_cycle: usize,
    in_states: Vec<InputState>,
}

/// A batch of packets borrowed from one input ring for sending.
pub struct OutputBatch {
    /// Input the packets came from; release goes back to this index even
    /// if the current input changed in the meantime.
    pub index: usize,
    pub packets: Vec<TsPacket>,
    pub metadata: Vec<PacketMetadata>,
}

/// The input switch core engine.
pub struct Core {
    /// Back-reference handed to the spawned tasks.
    me: Weak<Core>,
    opts: SwitchOptions,
    input_count: usize,
    shared: Mutex<CoreShared>,
    /// Signaled each time the current input reports new packets.
    got_input: Notify,
    terminate: CancellationToken,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    input_plugins: Mutex<Option<Vec<Box<dyn InputPlugin>>>>,
    output_plugin: Mutex<Option<Box<dyn OutputPlugin>>>,
    executors: OnceLock<Vec<InputExecutor>>,
    output: OnceLock<OutputExecutor>,
    watchdog: OnceLock<Watchdog>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Create the core over the given plugins. Options are validated here;
    /// nothing runs until [`start`](Self::start).
    pub fn new(
        opts: SwitchOptions,
        inputs: Vec<Box<dyn InputPlugin>>,
        output: Box<dyn OutputPlugin>,
    ) -> Result<Arc<Self>> {
        opts.validate(inputs.len())?;
        let input_count = inputs.len();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            shared: Mutex::new(CoreShared {
                state: CoreState::Stopped,
                cur_plugin: opts.first_input,
                next_plugin: opts.first_input,
                timeout_plugin: None,
                cur_cycle: 0,
                in_states: vec![InputState::Stopped; input_count],
            }),
            opts,
            input_count,
            got_input: Notify::new(),
            terminate: CancellationToken::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            input_plugins: Mutex::new(Some(inputs)),
            output_plugin: Mutex::new(Some(output)),
            executors: OnceLock::new(),
            output: OnceLock::new(),
            watchdog: OnceLock::new(),
            event_task: Mutex::new(None),
        }))
    }

    /// Start the switch processing: open the output device, spawn the
    /// executor tasks and start the initial input sessions.
    pub async fn start(&self) -> Result<()> {
        {
            let shared = self.shared.lock().unwrap();
            if shared.state != CoreState::Stopped {
                return Err(SwitchError::State(format!(
                    "wrong switch core state {:?}, cannot start",
                    shared.state
                )));
            }
        }

        // Open the output device before anything else runs.
        let mut output_plugin = self
            .output_plugin
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SwitchError::State("switch core already started once".into()))?;
        output_plugin.start().await?;

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| SwitchError::State("switch core was dropped".into()))?;

        // Event dispatch and watchdog tasks.
        let event_rx = self
            .event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SwitchError::State("switch core already started once".into()))?;
        *self.event_task.lock().unwrap() =
            Some(tokio::spawn(event_loop(Arc::clone(&me), event_rx)));
        let _ = self.watchdog.set(Watchdog::spawn(
            self.opts.receive_timeout,
            self.event_tx.clone(),
            self.terminate.clone(),
        ));

        // Spawn all input executor tasks. This starts the tasks only, not
        // the input sessions.
        let plugins = self
            .input_plugins
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SwitchError::State("switch core already started once".into()))?;
        let executors: Vec<InputExecutor> = plugins
            .into_iter()
            .enumerate()
            .map(|(index, plugin)| {
                InputExecutor::spawn(
                    index,
                    plugin,
                    self.opts.buffered_packets,
                    self.opts.max_input_packets,
                    self.opts.receive_timeout,
                    self.event_tx.clone(),
                    self.terminate.child_token(),
                )
            })
            .collect();
        let _ = self.executors.set(executors);

        // Output task, pulling from whatever input is current.
        let _ = self.output.set(OutputExecutor::spawn(me, output_plugin));

        // Start the initial input sessions.
        let mut shared = self.shared.lock().unwrap();
        shared.cur_plugin = self.opts.first_input;
        shared.next_plugin = self.opts.first_input;
        if self.opts.strategy == Strategy::Fast {
            // Start all inputs, they continue to receive in parallel. Flow
            // control is enabled on the current and the primary input; if
            // the primary produces, it rapidly becomes current and the
            // initial current one drops flow control.
            for index in 0..self.input_count {
                let flow_control =
                    index == shared.cur_plugin || Some(index) == self.opts.primary_input;
                self.start_plugin(&mut shared, index, flow_control);
            }
        } else {
            let first = shared.cur_plugin;
            self.start_plugin(&mut shared, first, true);
            // A distinct primary input is started right away as well.
            if let Some(primary) = self.opts.primary_input {
                if primary != first {
                    self.start_plugin(&mut shared, primary, true);
                }
            }
        }
        shared.state = CoreState::StartingNext;
        info!(inputs = self.input_count, strategy = ?self.opts.strategy, "switch core started");
        Ok(())
    }

    /// Stop the switch processing. `success` is false when the stop is
    /// triggered by an error.
    pub fn stop(&self, success: bool) {
        debug!(success, "stopping switch core");
        {
            let mut shared = self.shared.lock().unwrap();
            shared.state = CoreState::Stopped;
            if success {
                for state in &mut shared.in_states {
                    *state = InputState::Stopped;
                }
            }
        }
        // Cancelling the parent token terminates the executors, the
        // output wait, the watchdog and the event loop.
        self.terminate.cancel();
        self.got_input.notify_one();
        if let Some(executors) = self.executors.get() {
            for executor in executors {
                executor.terminate_input();
            }
        }
    }

    /// Switch to another input.
    pub fn set_input(&self, index: usize) {
        let mut shared = self.shared.lock().unwrap();
        self.set_input_locked(&mut shared, index, false, Direction::Unchanged);
    }

    /// Switch to the next input. During a switching phase this moves
    /// relative to the last selected target, not the current input.
    pub fn next_input(&self) {
        let mut shared = self.shared.lock().unwrap();
        let target = self.next_input_index(shared.next_plugin, Direction::Upward);
        self.set_input_locked(&mut shared, target, false, Direction::Upward);
    }

    /// Switch to the previous input.
    pub fn previous_input(&self) {
        let mut shared = self.shared.lock().unwrap();
        let target = self.next_input_index(shared.next_plugin, Direction::Downward);
        self.set_input_locked(&mut shared, target, false, Direction::Downward);
    }

    /// Wait until the current input has packets to output, then borrow
    /// them. Returns `None` when the switch is terminating.
    pub async fn get_output_area(&self) -> Option<OutputBatch> {
        loop {
            let notified = self.got_input.notified();
            if self.terminate.is_cancelled() {
                return None;
            }
            let cur = self.shared.lock().unwrap().cur_plugin;
            if let Some((packets, metadata)) = self.executor(cur).reserve_read() {
                return Some(OutputBatch {
                    index: cur,
                    packets,
                    metadata,
                });
            }
            notified.await;
        }
    }

    /// Release sent packets back to the input they came from. Returns
    /// false when the switch is terminating.
    pub fn output_sent(&self, index: usize, count: usize) -> bool {
        self.executor(index).release_read(count);
        !self.terminate.is_cancelled()
    }

    /// Wait for completion of the output and all input tasks.
    pub async fn wait_for_termination(&self) {
        if let Some(output) = self.output.get() {
            output.wait_for_termination().await;
        }
        if let Some(executors) = self.executors.get() {
            for executor in executors {
                executor.wait_for_termination().await;
            }
        }
        let event_task = self.event_task.lock().unwrap().take();
        if let Some(task) = event_task {
            let _ = task.await;
        }
    }

    fn executor(&self, index: usize) -> &InputExecutor {
        &self.executors.get().expect("switch core not started")[index]
    }

    /// Get the next input index, either upward or downward.
    fn next_input_index(&self, index: usize, dir: Direction) -> usize {
        match dir {
            Direction::Upward => (index + 1) % self.input_count,
            Direction::Downward => {
                if index > 0 {
                    index - 1
                } else {
                    self.input_count - 1
                }
            }
            Direction::Unchanged => index,
        }
    }

    /// Cancel the current receive timeout. Must be called with the core
    /// lock held.
    fn cancel_timeout(&self, shared: &mut CoreShared) {
        shared.timeout_plugin = None;
        if let Some(watchdog) = self.watchdog.get() {
            watchdog.suspend();
        }
    }

    /// Restart the receive timeout on a specific input. Must be called
    /// with the core lock held.
    fn restart_timeout(&self, shared: &mut CoreShared, index: usize) {
        shared.timeout_plugin = Some(index);
        if let Some(watchdog) = self.watchdog.get() {
            watchdog.restart();
        }
    }

    /// Start an input session. Must be called with the core lock held.
    fn start_plugin(&self, shared: &mut CoreShared, index: usize, flow_control: bool) {
        debug!(index, "starting input session");
        shared.in_states[index] = InputState::Starting;
        self.executor(index).start_input(flow_control);
    }

    /// Stop an input session. Must be called with the core lock held.
    fn stop_plugin(&self, shared: &mut CoreShared, index: usize, abort: bool) {
        debug!(index, abort, "stopping input session");
        shared.in_states[index] = InputState::Stopping;
        self.executor(index).stop_input(abort);
    }

    /// Change the current input, with the core lock held. Depending on
    /// the strategy, the switch completes asynchronously in the
    /// `input_started` / `input_received` / `input_stopped` handlers.
    fn set_input_locked(
        &self,
        shared: &mut CoreShared,
        index: usize,
        abort_current: bool,
        dir: Direction,
    ) {
        if index == shared.next_plugin {
            // Already switching to this one.
            return;
        }
        if index >= self.input_count {
            warn!(index, "invalid input index");
            return;
        }

        // A switch can only start from a stable state.
        match shared.state {
            CoreState::Running => {
                debug!(from = shared.next_plugin, to = index, "switching input");
            }
            CoreState::StartingNext => {
                info!(
                    starting = shared.next_plugin,
                    target = index,
                    "currently starting an input, cannot switch now, try later"
                );
                return;
            }
            CoreState::StoppingPrevious => {
                info!(
                    stopping = shared.cur_plugin,
                    target = index,
                    "currently stopping an input, cannot switch now, try later"
                );
                return;
            }
            CoreState::Stopped => {
                error!(target = index, "switch core is stopped, cannot switch");
                return;
            }
        }

        match self.opts.strategy {
            Strategy::Sequential => {
                // Stop the current input, then start the next one once the
                // stop completed (see input_stopped).
                shared.next_plugin = index;
                self.cancel_timeout(shared);
                if Some(shared.cur_plugin) == self.opts.primary_input {
                    // The primary input is never stopped; start the target
                    // directly, completion is notified by input_started.
                    shared.state = CoreState::StartingNext;
                    shared.cur_plugin = index;
                    self.start_plugin(shared, index, true);
                } else {
                    shared.state = CoreState::StoppingPrevious;
                    let cur = shared.cur_plugin;
                    self.stop_plugin(shared, cur, abort_current);
                }
            }
            Strategy::Delayed => {
                // Start the next input first; the current one is stopped
                // when the next produces its first packet (input_received).
                shared.next_plugin = index;
                self.cancel_timeout(shared);
                if Some(index) == self.opts.primary_input
                    && shared.in_states[index] == InputState::Running
                {
                    // The primary is already receiving: immediately
                    // operational, only the previous input must stop.
                    let cur = shared.cur_plugin;
                    self.stop_plugin(shared, cur, false);
                    shared.state = CoreState::Running;
                    shared.cur_plugin = index;
                    self.restart_timeout(shared, index);
                } else {
                    self.start_plugin(shared, index, true);
                    shared.state = CoreState::StartingNext;
                }
            }
            Strategy::Fast => {
                // No switching phase: current and next are always
                // identical and the current pointer flips atomically.
                debug_assert_eq!(shared.cur_plugin, shared.next_plugin);
                let mut target = index;
                while shared.in_states[target] != InputState::Running {
                    if dir == Direction::Unchanged {
                        warn!(index = target, "input not started, not switching");
                        return;
                    }
                    warn!(index = target, "input not started, trying the next one");
                    target = self.next_input_index(target, dir);
                    if target == index {
                        warn!("no input started, not switching");
                        return;
                    }
                }
                if target != shared.cur_plugin {
                    let old = shared.cur_plugin;
                    self.executor(old).set_flow_control(false);
                    shared.cur_plugin = target;
                    shared.next_plugin = target;
                    self.executor(target).set_flow_control(true);
                    self.restart_timeout(shared, target);
                }
            }
        }
    }

    /// An input session start completed.
    fn on_input_started(&self, index: usize, ok: bool) {
        let mut shared = self.shared.lock().unwrap();
        debug!(index, ok, "input started");

        // Spurious notification for an already running input.
        if shared.in_states[index] == InputState::Running {
            return;
        }
        shared.in_states[index] = InputState::Running;

        if index != shared.next_plugin {
            return;
        }

        match self.opts.strategy {
            Strategy::Sequential => {
                // End of the switching process: the previous input already
                // stopped and the current one was set at switch time.
                shared.state = CoreState::Running;
                debug_assert_eq!(shared.cur_plugin, shared.next_plugin);
            }
            Strategy::Delayed => {
                // The previous input keeps running; the swap happens on
                // the first packet of the next input.
                debug_assert_eq!(shared.state, CoreState::StartingNext);
            }
            Strategy::Fast => {
                debug_assert_eq!(shared.cur_plugin, shared.next_plugin);
            }
        }

        // Place a timeout on the first input operation.
        let cur = shared.cur_plugin;
        self.restart_timeout(&mut shared, cur);
    }

    /// An input committed packets to its ring.
    fn on_input_received(&self, index: usize) {
        let mut shared = self.shared.lock().unwrap();
        trace!(index, "input received");

        // First packet of the next input in a delayed switch: complete the
        // switch.
        if self.opts.strategy == Strategy::Delayed
            && shared.state == CoreState::StartingNext
            && index == shared.next_plugin
        {
            let cur = shared.cur_plugin;
            // Stop the previous input unless it is the primary one or the
            // switch was degenerate (initial start).
            if cur != index && Some(cur) != self.opts.primary_input {
                self.stop_plugin(&mut shared, cur, false);
            }
            shared.cur_plugin = shared.next_plugin;
            shared.state = CoreState::Running;
        }

        // Data on the primary input pre-empts the current one.
        if Some(index) == self.opts.primary_input && shared.cur_plugin != index {
            debug!(index, "data on primary input, switching to it");
            if self.opts.strategy == Strategy::Fast {
                // Keep everything running, only flip flow control.
                let cur = shared.cur_plugin;
                self.executor(cur).set_flow_control(false);
                if shared.next_plugin != cur && shared.next_plugin != index {
                    self.executor(shared.next_plugin).set_flow_control(false);
                }
            } else {
                // Abort and close all other inputs.
                for other in 0..self.input_count {
                    if other != index
                        && shared.in_states[other] != InputState::Stopping
                        && shared.in_states[other] != InputState::Stopped
                    {
                        self.stop_plugin(&mut shared, other, true);
                    }
                }
            }
            shared.cur_plugin = index;
            shared.next_plugin = index;
        }

        // Packets on the current input: re-arm the watchdog and wake up
        // the output.
        if index == shared.cur_plugin {
            self.restart_timeout(&mut shared, index);
            self.got_input.notify_one();
        }
    }

    /// An input session stopped. Returns true when the complete switch
    /// processing must stop; the caller issues that stop outside the lock.
    fn on_input_stopped(&self, index: usize, ok: bool) -> bool {
        let mut shared = self.shared.lock().unwrap();
        debug!(index, ok, "input stopped");

        // Spurious notification for an already stopped input.
        if shared.in_states[index] == InputState::Stopped {
            return false;
        }
        shared.in_states[index] = InputState::Stopped;

        // Count a cycle when the last input terminates.
        if index == self.input_count - 1 {
            shared.cur_cycle += 1;
            debug!(cycle = shared.cur_cycle, "input cycle completed");
        }

        let stop_request = self.opts.terminate
            || (self.opts.cycle_count > 0 && shared.cur_cycle >= self.opts.cycle_count);

        if stop_request {
            // Do not trigger a receive timeout while terminating.
            self.cancel_timeout(&mut shared);
        } else {
            match shared.state {
                CoreState::Stopped => {}
                CoreState::Running => {
                    // The current input terminated on its own: failover to
                    // the next one.
                    if index == shared.cur_plugin {
                        let target = self.next_input_index(index, Direction::Upward);
                        self.set_input_locked(&mut shared, target, false, Direction::Upward);
                    }
                }
                CoreState::StartingNext => {
                    // Nothing to do on a stop in the middle of a switch.
                }
                CoreState::StoppingPrevious => {
                    if self.opts.strategy == Strategy::Sequential && index == shared.cur_plugin {
                        // The previous input stopped: now start the next
                        // one.
                        shared.state = CoreState::StartingNext;
                        shared.cur_plugin = shared.next_plugin;
                        let cur = shared.cur_plugin;
                        self.start_plugin(&mut shared, cur, true);
                    }
                }
            }
        }

        stop_request
    }

    /// The receive timeout expired: failover to the next input.
    fn on_timeout(&self) {
        let mut shared = self.shared.lock().unwrap();

        // Filter out a timeout delivered after the watchdog was suspended.
        let Some(timeout_plugin) = shared.timeout_plugin else {
            return;
        };

        // In the middle of a delayed switch, the timed-out target is
        // abandoned and the switch reverted before failing over.
        if self.opts.strategy == Strategy::Delayed
            && shared.state == CoreState::StartingNext
            && timeout_plugin == shared.next_plugin
        {
            if Some(shared.next_plugin) != self.opts.primary_input {
                let next = shared.next_plugin;
                self.stop_plugin(&mut shared, next, true);
            }
            shared.next_plugin = shared.cur_plugin;
            shared.state = CoreState::Running;
        }

        info!(index = timeout_plugin, "receive timeout, switching to the next input");
        let target = self.next_input_index(timeout_plugin, Direction::Upward);
        self.set_input_locked(&mut shared, target, false, Direction::Upward);
    }
}

/// Dispatch executor and watchdog events to the core handlers.
async fn event_loop(core: Arc<Core>, mut event_rx: mpsc::UnboundedReceiver<Event>) {
    loop {
        tokio::select! {
            _ = core.terminate.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::InputStarted { index, ok } => core.on_input_started(index, ok),
                    Event::InputReceived { index } => core.on_input_received(index),
                    Event::InputStopped { index, ok } => {
                        if core.on_input_stopped(index, ok) {
                            // The global stop is issued outside the core
                            // lock.
                            info!("all input cycles completed, stopping");
                            core.stop(true);
                        }
                    }
                    Event::Timeout => core.on_timeout(),
                }
            }
        }
    }
    debug!("core event loop terminated");
}
