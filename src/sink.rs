//! Persistence collaborator for delivered payload.
//!
//! The server hands every newly delivered chunk to a [`PayloadSink`] chosen
//! at construction.  Duplicates never reach the sink, and chunks arrive in
//! delivery order, so a sink only decides *where* bytes end up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Receives delivered chunks in order.
pub trait PayloadSink: Send {
    /// Persist `chunk` (which carried `seq_num`); `message` is the whole
    /// message delivered so far on this connection, `chunk` included.
    fn deliver(&mut self, seq_num: u32, chunk: &[u8], message: &[u8]) -> io::Result<()>;
}

/// Keeps delivered chunks in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub chunks: Vec<(u32, Vec<u8>)>,
}

impl MemorySink {
    /// Concatenation of every chunk received, across connections.
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|(_, c)| c.iter().copied()).collect()
    }
}

impl PayloadSink for MemorySink {
    fn deliver(&mut self, seq_num: u32, chunk: &[u8], _message: &[u8]) -> io::Result<()> {
        self.chunks.push((seq_num, chunk.to_vec()));
        Ok(())
    }
}

/// Writes delivered payload into a directory.
///
/// `received-full-msg.txt` is rewritten with the whole message after every
/// chunk; each chunk is also written to `received-seqnum-<seq>.txt`.
#[derive(Debug, Clone)]
pub struct DirSink {
    dir: PathBuf,
}

impl DirSink {
    pub const FULL_MESSAGE: &'static str = "received-full-msg.txt";

    /// Use `dir`, creating it (and its parents) if needed.
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, seq_num: u32) -> PathBuf {
        self.dir.join(format!("received-seqnum-{seq_num}.txt"))
    }
}

impl PayloadSink for DirSink {
    fn deliver(&mut self, seq_num: u32, chunk: &[u8], message: &[u8]) -> io::Result<()> {
        fs::write(self.dir.join(Self::FULL_MESSAGE), message)?;
        fs::write(self.chunk_path(seq_num), chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_order() {
        let mut sink = MemorySink::default();
        sink.deliver(1, b"HELL", b"HELL").unwrap();
        sink.deliver(5, b"O WO", b"HELLO WO").unwrap();
        assert_eq!(sink.bytes(), b"HELLO WO");
        assert_eq!(sink.chunks[1].0, 5);
    }

    #[test]
    fn dir_sink_writes_message_and_chunks() {
        let dir = std::env::temp_dir().join(format!("rdt-sink-{}", std::process::id()));
        let mut sink = DirSink::create(&dir).unwrap();
        sink.deliver(8, b"HELL", b"HELL").unwrap();
        sink.deliver(12, b"O", b"HELLO").unwrap();

        assert_eq!(fs::read(dir.join(DirSink::FULL_MESSAGE)).unwrap(), b"HELLO");
        assert_eq!(fs::read(sink.chunk_path(8)).unwrap(), b"HELL");
        assert_eq!(fs::read(sink.chunk_path(12)).unwrap(), b"O");
        fs::remove_dir_all(&dir).unwrap();
    }
}
