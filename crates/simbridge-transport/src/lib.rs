pub mod channel;
pub mod codec;
pub mod error;
pub mod framed;
pub mod memory;
#[cfg(target_os = "linux")]
pub mod posix;

pub use channel::{ControlChannel, PayloadRegion};
pub use error::TransportError;
pub use framed::{FramedTransport, Received};
pub use memory::{MemoryChannel, MemoryRegion};
