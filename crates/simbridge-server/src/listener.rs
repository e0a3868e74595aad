use std::sync::Arc;

use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use simbridge_lifecycle::Bridge;
use simbridge_transport::{ControlChannel, FramedTransport, PayloadRegion, TransportError};
use simbridge_types::InstructionBatch;

/// Counters of one step loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepLoopSummary {
    pub handled: u64,
    pub failed: u64,
}

/// Answer every request on `transport` until the request channel closes or
/// `shutdown` flips to true.
///
/// Blocks the calling thread, which must not be a runtime worker. A request that
/// cannot be decoded or processed is answered with an empty batch so the
/// engine is never left waiting. Every such failure is raised to the bridge's
/// alerter.
pub fn serve_steps<C: ControlChannel, R: PayloadRegion>(
    mut transport: FramedTransport<C, R>,
    bridge: Arc<Bridge>,
    runtime: Handle,
    shutdown: watch::Receiver<bool>,
) -> StepLoopSummary {
    let mut summary = StepLoopSummary::default();
    let alerter = bridge.scheduler().alerter();
    info!("step listener started");
    loop {
        if *shutdown.borrow() {
            info!("shutdown requested, step listener stopping");
            break;
        }

        let batch = match transport.receive_snapshot() {
            Ok((snapshot, received)) => match runtime.block_on(bridge.handle_snapshot(snapshot, received)) {
                Ok(batch) => {
                    summary.handled += 1;
                    batch
                }
                Err(e) => {
                    error!(error = %e, "step failed, answering with empty batch");
                    summary.failed += 1;
                    runtime.block_on(alerter.alert("step failed", json!({ "error": e.to_string() })));
                    InstructionBatch::empty()
                }
            },
            Err(TransportError::Closed) => {
                info!("request channel closed, step listener stopping");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to receive snapshot, answering with empty batch");
                summary.failed += 1;
                runtime.block_on(alerter.alert("failed to receive snapshot", json!({ "error": e.to_string() })));
                InstructionBatch::empty()
            }
        };

        match transport.respond(&batch) {
            Ok(bytes) => debug!(bytes, "response published"),
            Err(TransportError::Closed) => {
                info!("response channel closed, step listener stopping");
                break;
            }
            Err(e) => {
                error!(error = %e, "failed to publish response");
                runtime.block_on(alerter.alert("failed to publish response", json!({ "error": e.to_string() })));
            }
        }
    }
    summary
}
