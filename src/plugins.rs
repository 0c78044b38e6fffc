//! File-based input and output plugins for the relay binary.

use std::path::PathBuf;

use async_trait::async_trait;
use switch::{InputPlugin, OutputPlugin, SwitchError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use ts::{PACKET_SIZE, PacketMetadata, TsPacket};

const READ_CHUNK: usize = 64 * 1024;

/// Reads a transport stream from a file, or from standard input for "-".
pub struct FileInput {
    path: String,
    reader: Option<Box<dyn AsyncRead + Unpin + Send>>,
    /// Bytes read but not yet aligned to a full packet.
    buffer: Vec<u8>,
}

impl FileInput {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl InputPlugin for FileInput {
    fn name(&self) -> &str {
        "file"
    }

    async fn start(&mut self) -> switch::Result<()> {
        debug!(path = %self.path, "opening input file");
        self.buffer.clear();
        self.reader = Some(if self.path == "-" {
            Box::new(tokio::io::stdin())
        } else {
            Box::new(tokio::fs::File::open(&self.path).await?)
        });
        Ok(())
    }

    async fn receive(
        &mut self,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> switch::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };

        let mut chunk = vec![0u8; READ_CHUNK];
        while self.buffer.len() < PACKET_SIZE {
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                // End of file; an unaligned tail is dropped.
                self.buffer.clear();
                return Ok(0);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }

        let count = packets.len().min(self.buffer.len() / PACKET_SIZE);
        for (index, packet) in packets[..count].iter_mut().enumerate() {
            let offset = index * PACKET_SIZE;
            *packet = TsPacket::from_slice(&self.buffer[offset..offset + PACKET_SIZE])
                .map_err(SwitchError::input)?;
        }
        self.buffer.drain(..count * PACKET_SIZE);
        Ok(count)
    }

    async fn stop(&mut self) -> switch::Result<()> {
        self.reader = None;
        self.buffer.clear();
        Ok(())
    }
}

/// Writes the relayed transport stream to a file, or to standard output
/// when no path is given.
pub struct FileOutput {
    path: Option<PathBuf>,
    writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
}

impl FileOutput {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, writer: None }
    }
}

#[async_trait]
impl OutputPlugin for FileOutput {
    fn name(&self) -> &str {
        "file"
    }

    async fn start(&mut self) -> switch::Result<()> {
        self.writer = Some(match &self.path {
            Some(path) => {
                debug!(path = %path.display(), "creating output file");
                Box::new(tokio::fs::File::create(path).await?)
            }
            None => Box::new(tokio::io::stdout()),
        });
        Ok(())
    }

    async fn send(
        &mut self,
        packets: &[TsPacket],
        _metadata: &[PacketMetadata],
    ) -> switch::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SwitchError::State("output is not open".into()));
        };
        let mut bytes = Vec::with_capacity(packets.len() * PACKET_SIZE);
        for packet in packets {
            bytes.extend_from_slice(packet.as_bytes());
        }
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn stop(&mut self) -> switch::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        self.writer = None;
        Ok(())
    }
}
