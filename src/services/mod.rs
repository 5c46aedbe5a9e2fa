//! Business logic services

pub mod cancellation;
pub mod import;
pub mod job_store;
