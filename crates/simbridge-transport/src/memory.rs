//! In-process stand-ins for the POSIX queue and shared memory region.
//! Clones share the same slot, so one clone can play the engine side.

use std::sync::{Arc, Condvar, Mutex};

use crate::channel::{ControlChannel, PayloadRegion};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct Slot {
    header: Option<u64>,
    closed: bool,
}

/// Single-slot blocking channel with the same capacity as the request queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<(Mutex<Slot>, Condvar)>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake all blocked callers with `TransportError::Closed`.
    pub fn close(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut slot) = lock.lock() {
            slot.closed = true;
        }
        cvar.notify_all();
    }
}

impl ControlChannel for MemoryChannel {
    fn send_header(&mut self, length: u64) -> Result<(), TransportError> {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock().map_err(|_| TransportError::Closed)?;
        while slot.header.is_some() && !slot.closed {
            slot = cvar.wait(slot).map_err(|_| TransportError::Closed)?;
        }
        if slot.closed {
            return Err(TransportError::Closed);
        }
        slot.header = Some(length);
        cvar.notify_all();
        Ok(())
    }

    fn receive_header(&mut self) -> Result<u64, TransportError> {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock().map_err(|_| TransportError::Closed)?;
        loop {
            if let Some(length) = slot.header.take() {
                cvar.notify_all();
                return Ok(length);
            }
            if slot.closed {
                return Err(TransportError::Closed);
            }
            slot = cvar.wait(slot).map_err(|_| TransportError::Closed)?;
        }
    }
}

/// Shared byte buffer standing in for a shared memory segment.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegion {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PayloadRegion for MemoryRegion {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut region = self.bytes.lock().map_err(|_| TransportError::Closed)?;
        region.clear();
        region.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, length: usize) -> Result<Vec<u8>, TransportError> {
        let region = self.bytes.lock().map_err(|_| TransportError::Closed)?;
        if region.len() < length {
            return Err(TransportError::Truncated {
                expected: length,
                available: region.len(),
            });
        }
        Ok(region[..length].to_vec())
    }
}
