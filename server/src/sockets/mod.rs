//! Duplex-socket distribution of per-device process listings.

pub mod hub;
