pub mod alert;
pub mod duty;
pub mod scheduler;

pub use alert::*;
pub use duty::*;
pub use scheduler::*;
