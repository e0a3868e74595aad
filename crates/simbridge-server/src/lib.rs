pub mod cli;
pub mod handlers;
pub mod listener;
pub mod state;

pub use handlers::router;
pub use listener::{StepLoopSummary, serve_steps};
pub use state::AppState;
