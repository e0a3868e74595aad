pub mod entry;
pub mod state;
pub mod step;

pub use entry::*;
pub use state::*;
pub use step::*;
