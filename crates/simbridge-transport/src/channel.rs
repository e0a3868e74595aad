use crate::error::TransportError;

/// Single-slot control path that carries only payload lengths.
pub trait ControlChannel: Send {
    /// Publish a length header. Blocks while the slot is occupied.
    fn send_header(&mut self, length: u64) -> Result<(), TransportError>;

    /// Block until a length header is available and return it.
    fn receive_header(&mut self) -> Result<u64, TransportError>;
}

/// Named memory region that holds one payload at a time.
pub trait PayloadRegion: Send {
    /// Replace the region contents with `bytes`, resizing it as needed.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Copy out exactly `length` bytes from the start of the region.
    fn read(&mut self, length: usize) -> Result<Vec<u8>, TransportError>;
}
