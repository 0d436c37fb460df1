//! Unit test harness

mod test_hub;
mod test_poller;
mod test_queue;
mod test_relay;
