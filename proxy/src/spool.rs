use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// In-memory cap before a spooled body spills to disk.
pub const SPOOL_MEM_MAX: usize = 64 * 1024;

/// A response body being buffered so its length can be measured before any
/// byte hits the wire. Small bodies stay in memory; anything past the cap
/// spills into an anonymous temp file that vanishes on drop.
pub struct SpooledBody {
    mem: Vec<u8>,
    file: Option<File>,
    len: u64,
}

impl SpooledBody {
    pub fn new() -> Self {
        SpooledBody {
            mem: Vec::new(),
            file: None,
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn push(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() && self.mem.len() + chunk.len() > SPOOL_MEM_MAX {
            // tempfile() is already unlinked; nothing to clean up on close.
            let mut file = File::from_std(tempfile::tempfile()?);
            file.write_all(&self.mem).await?;
            self.mem = Vec::new();
            self.file = Some(file);
        }

        match &mut self.file {
            Some(file) => file.write_all(chunk).await?,
            None => self.mem.extend_from_slice(chunk),
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Replay the buffered body into `dst`.
    pub async fn write_into<W: AsyncWrite + Unpin>(mut self, dst: &mut W) -> std::io::Result<()> {
        match &mut self.file {
            Some(file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                tokio::io::copy(file, dst).await?;
            }
            None => dst.write_all(&self.mem).await?,
        }
        Ok(())
    }
}

impl Default for SpooledBody {
    fn default() -> Self {
        Self::new()
    }
}
