//! Plugin seams of the switch engine.
//!
//! Input and output plugins are driven by their executors; they never see
//! the ring or the core state machine. A blocked `receive` is cancelled by
//! dropping its future, so plugins need no explicit abort entry point:
//! they only have to tolerate a new `stop`/`start` after a cancelled call.

use async_trait::async_trait;
use ts::{PacketMetadata, TsPacket};

use crate::Result;

/// A source of transport stream packets.
#[async_trait]
pub trait InputPlugin: Send {
    /// Short plugin name used in logs.
    fn name(&self) -> &str;

    /// Open the input device and start a session.
    async fn start(&mut self) -> Result<()>;

    /// Receive packets into the caller-provided slices and return how many
    /// were stored. Zero means the end of the session. May block until
    /// data is available.
    async fn receive(
        &mut self,
        packets: &mut [TsPacket],
        metadata: &mut [PacketMetadata],
    ) -> Result<usize>;

    /// Close the input device at the end of a session.
    async fn stop(&mut self) -> Result<()>;
}

/// A sink for transport stream packets.
#[async_trait]
pub trait OutputPlugin: Send {
    /// Short plugin name used in logs.
    fn name(&self) -> &str;

    /// Open the output device.
    async fn start(&mut self) -> Result<()>;

    /// Write a batch of packets. The batch is released back to its input
    /// ring once this returns.
    async fn send(&mut self, packets: &[TsPacket], metadata: &[PacketMetadata]) -> Result<()>;

    /// Close the output device.
    async fn stop(&mut self) -> Result<()>;
}
