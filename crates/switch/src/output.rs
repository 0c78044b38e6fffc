//! Output side of the switch: one task pulling batches from whichever
//! input the core designates and writing them to the output plugin.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::core::Core;
use crate::plugin::OutputPlugin;

/// Handle to the output task.
pub(crate) struct OutputExecutor {
    join: Mutex<Option<JoinHandle<()>>>,
}

impl OutputExecutor {
    /// Spawn the output task. The plugin device must already be open.
    pub(crate) fn spawn(core: Arc<Core>, plugin: Box<dyn OutputPlugin>) -> Self {
        let join = tokio::spawn(run(core, plugin));
        Self {
            join: Mutex::new(Some(join)),
        }
    }

    /// Wait for the output task to exit.
    pub(crate) async fn wait_for_termination(&self) {
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

async fn run(core: Arc<Core>, mut plugin: Box<dyn OutputPlugin>) {
    debug!(plugin = plugin.name(), "output executor started");

    while let Some(batch) = core.get_output_area().await {
        trace!(
            index = batch.index,
            count = batch.packets.len(),
            "sending output packets"
        );
        if let Err(e) = plugin.send(&batch.packets, &batch.metadata).await {
            error!(error = %e, "output plugin failed, terminating");
            core.stop(false);
            break;
        }
        // Release the packets to the input they came from, which is not
        // necessarily the current one anymore.
        if !core.output_sent(batch.index, batch.packets.len()) {
            break;
        }
    }

    if let Err(e) = plugin.stop().await {
        warn!(error = %e, "output plugin failed to stop");
    }
    debug!("output executor terminated");
}
