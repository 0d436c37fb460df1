//! Live metrics distribution: the external metrics source client and the
//! per-device polling fan-out.

pub mod poller;
pub mod source;
