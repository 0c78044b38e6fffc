//! Raw MPEG Transport Stream packet types
//!
//! This crate provides the fixed-size packet and per-packet metadata types
//! used by the relay engine. Packets are carried as opaque 188-byte units;
//! no demuxing or table parsing happens here.

pub mod error;
pub mod metadata;
pub mod packet;

pub use error::TsError;
pub use metadata::PacketMetadata;
pub use packet::{PACKET_SIZE, PID_NULL, SYNC_BYTE, TsPacket};

/// Result type for TS packet operations
pub type Result<T> = std::result::Result<T, TsError>;
