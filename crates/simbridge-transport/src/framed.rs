use std::time::Instant;

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use simbridge_types::{InstructionBatch, StateSnapshot};

use crate::channel::{ControlChannel, PayloadRegion};
use crate::codec;
use crate::error::TransportError;

/// A decoded inbound message and when its header arrived.
#[derive(Debug)]
pub struct Received<T> {
    pub message: T,
    pub started: Instant,
    pub size: usize,
}

/// Length-prefixed transport over a control channel and a payload region per direction.
///
/// Outbound payloads are always fully written to the region before the header is
/// published, so a peer that wakes on the header never observes a partial payload.
pub struct FramedTransport<C, R> {
    inbound_channel: C,
    inbound_region: R,
    outbound_channel: C,
    outbound_region: R,
}

impl<C: ControlChannel, R: PayloadRegion> FramedTransport<C, R> {
    pub fn new(inbound_channel: C, inbound_region: R, outbound_channel: C, outbound_region: R) -> Self {
        Self {
            inbound_channel,
            inbound_region,
            outbound_channel,
            outbound_region,
        }
    }

    /// Block until the next message arrives and decode it.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<Received<T>, TransportError> {
        let length = self.inbound_channel.receive_header()?;
        let started = Instant::now();
        let length = usize::try_from(length).map_err(|_| TransportError::Truncated {
            expected: usize::MAX,
            available: 0,
        })?;
        let bytes = self.inbound_region.read(length)?;
        debug!(bytes = length, elapsed = ?started.elapsed(), "payload copied from region");
        let message = codec::decode(&bytes)?;
        debug!(elapsed = ?started.elapsed(), "payload decoded");
        Ok(Received {
            message,
            started,
            size: length,
        })
    }

    /// Encode and publish a message: region first, header last.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<usize, TransportError> {
        let bytes = codec::encode(message)?;
        self.outbound_region.write(&bytes)?;
        self.outbound_channel.send_header(bytes.len() as u64)?;
        Ok(bytes.len())
    }

    /// Receive the next state snapshot along with the instant its header arrived.
    pub fn receive_snapshot(&mut self) -> Result<(StateSnapshot, Instant), TransportError> {
        let received = self.receive::<StateSnapshot>()?;
        Ok((received.message, received.started))
    }

    pub fn respond(&mut self, batch: &InstructionBatch) -> Result<usize, TransportError> {
        self.send(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::memory::{MemoryChannel, MemoryRegion};

    /// Records every operation so ordering can be asserted.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    struct RecordingChannel(Recorder);
    struct RecordingRegion(Recorder);

    impl ControlChannel for RecordingChannel {
        fn send_header(&mut self, _length: u64) -> Result<(), TransportError> {
            self.0.0.lock().unwrap().push("header");
            Ok(())
        }

        fn receive_header(&mut self) -> Result<u64, TransportError> {
            Err(TransportError::Closed)
        }
    }

    impl PayloadRegion for RecordingRegion {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            self.0.0.lock().unwrap().push("payload");
            Ok(())
        }

        fn read(&mut self, _length: usize) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
    }

    struct FailingRegion;

    impl PayloadRegion for FailingRegion {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Io {
                object: "/responses".into(),
                source: std::io::Error::other("disk full"),
            })
        }

        fn read(&mut self, _length: usize) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_payload_written_before_header() {
        let recorder = Recorder::default();
        let mut transport = FramedTransport::new(
            RecordingChannel(recorder.clone()),
            RecordingRegion(recorder.clone()),
            RecordingChannel(recorder.clone()),
            RecordingRegion(recorder.clone()),
        );
        transport.respond(&InstructionBatch::empty()).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["payload", "header"]);
    }

    #[test]
    fn test_failed_payload_write_publishes_no_header() {
        let header_channel = MemoryChannel::new();
        let mut transport = FramedTransport::new(
            MemoryChannel::new(),
            FailingRegion,
            header_channel.clone(),
            FailingRegion,
        );
        assert!(transport.respond(&InstructionBatch::empty()).is_err());

        // The slot is still free: a header can be sent without blocking.
        let mut peer = header_channel.clone();
        peer.send_header(1).unwrap();
        assert_eq!(peer.receive_header().unwrap(), 1);
    }

    #[test]
    fn test_receive_reports_truncated_region() {
        let mut engine_channel = MemoryChannel::new();
        let mut engine_region = MemoryRegion::new();
        let mut transport = FramedTransport::new(
            engine_channel.clone(),
            engine_region.clone(),
            MemoryChannel::new(),
            MemoryRegion::new(),
        );
        engine_region.write(&[0xa0]).unwrap();
        engine_channel.send_header(64).unwrap();

        let result = transport.receive_snapshot();
        assert!(matches!(result, Err(TransportError::Truncated { .. })));
    }
}
