//! Database models split into separate files.

pub mod delivery;
pub mod execution;
pub mod scheduled_job;
pub mod task;

pub use self::delivery::*;
pub use self::execution::*;
pub use self::scheduled_job::*;
pub use self::task::*;
