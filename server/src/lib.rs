//! NetPulse Server Library
//!
//! Core modules for the real-time device-monitoring pipeline.

pub mod app;
pub mod errors;
pub mod logs;
pub mod metrics;
pub mod scan;
pub mod server;
pub mod sockets;
pub mod store;
