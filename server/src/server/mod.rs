//! REST and server-push surface of the pipeline.

pub mod handlers;
pub mod serve;
pub mod sse;
pub mod state;
