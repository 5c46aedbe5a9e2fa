//! Type definitions

pub mod import;
pub mod job;
pub mod messages;

pub use import::*;
pub use job::*;
pub use messages::*;
