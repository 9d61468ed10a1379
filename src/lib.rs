pub mod connection;
pub mod fetch;
pub mod fleet;
pub mod queue;
pub mod rate_limit;
pub mod report;
pub mod timed_map;
pub mod timer;
pub mod transport;
