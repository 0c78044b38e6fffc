use thiserror::Error;

/// Errors that can occur when handling raw TS packets
#[derive(Error, Debug)]
pub enum TsError {
    #[error("Invalid packet size: expected 188 bytes, got {0}")]
    InvalidPacketSize(usize),

    #[error("Invalid sync byte: expected 0x47, got 0x{0:02x}")]
    InvalidSyncByte(u8),
}
