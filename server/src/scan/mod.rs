//! Subnet discovery: scan options, the probing primitive, and the job queue
//! that runs scans asynchronously and streams state through the job store.

pub mod discovery;
pub mod queue;
pub mod types;
