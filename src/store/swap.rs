//! The swap-in seam between readers and whatever holds spooled objects.
//!
//! The on-disk block layout is not this crate's business; readers only
//! need to open a numbered swap file and read ranges out of it. Reads
//! complete asynchronously through the engine queue, like every other
//! suspension point.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::event::{Call, Engine};

/// A source of swap files.
pub trait SwapStore: Send + Sync {
    /// Open a swap file for reading.
    fn open(&self, file: u32) -> Result<Box<dyn SwapFile>>;
}

/// One open swap-in stream.
pub trait SwapFile: Send {
    /// Read up to `len` bytes at `offset`. `done` is invoked from the
    /// engine queue; a short (or empty) buffer means end of file.
    fn read(&mut self, offset: u64, len: usize, done: Box<dyn FnOnce(Result<Bytes>) + Send>);
}

/// Memory-backed swap store: the reference backend for tests and for
/// memory-only deployments. Files are installed whole.
pub struct MemSwapStore {
    engine: Arc<Engine>,
    files: Mutex<HashMap<u32, Bytes>>,
}

impl MemSwapStore {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Install the full contents of a swap file.
    pub fn insert(&self, file: u32, contents: Bytes) {
        self.files.lock().insert(file, contents);
    }

    pub fn len(&self, file: u32) -> Option<u64> {
        self.files.lock().get(&file).map(|b| b.len() as u64)
    }
}

impl SwapStore for MemSwapStore {
    fn open(&self, file: u32) -> Result<Box<dyn SwapFile>> {
        let data = self
            .files
            .lock()
            .get(&file)
            .cloned()
            .ok_or_else(|| anyhow!("swap file {} does not exist", file))?;
        Ok(Box::new(MemSwapFile {
            engine: self.engine.clone(),
            data,
        }))
    }
}

struct MemSwapFile {
    engine: Arc<Engine>,
    data: Bytes,
}

impl SwapFile for MemSwapFile {
    fn read(&mut self, offset: u64, len: usize, done: Box<dyn FnOnce(Result<Bytes>) + Send>) {
        let data = self.data.clone();
        self.engine.schedule(Call::new("SwapFile::read", move || {
            let start = (offset as usize).min(data.len());
            let end = (start + len).min(data.len());
            done(Ok(data.slice(start..end)));
        }));
    }
}
