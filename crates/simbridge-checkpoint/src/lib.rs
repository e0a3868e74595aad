pub mod document;
pub mod error;
pub mod migration;
pub mod store;

pub use document::*;
pub use error::CheckpointError;
pub use migration::{MigrationContext, Migrated};
pub use store::{CheckpointStore, Loaded};
