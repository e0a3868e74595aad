pub mod archive;
pub mod bridge;
pub mod collaborators;
pub mod fundamental;
pub mod notify;
pub mod run_state;

pub use archive::{ArchiveReport, LogArchiver};
pub use bridge::Bridge;
pub use collaborators::*;
pub use fundamental::load_fundamental;
pub use notify::ErrorReportPolicy;
pub use run_state::MarketRunState;
