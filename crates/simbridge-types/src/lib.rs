pub mod config;
pub mod dynamic;
pub mod error;
pub mod instructions;
pub mod notification;
pub mod phase;
pub mod snapshot;

pub use config::*;
pub use dynamic::DynamicValue;
pub use error::*;
pub use instructions::*;
pub use notification::*;
pub use phase::*;
pub use snapshot::*;
