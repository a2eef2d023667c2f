//! Business logic services

pub mod cancellation;
pub mod collector;
pub mod executor;
pub mod import_pipeline;
pub mod job_history;
pub mod phone;
pub mod retry;
pub mod rows;
