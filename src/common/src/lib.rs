pub mod gtid;
pub mod simtime;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShutdownMessage {
    // only use in initialize.
    Init,
    Cancel(String),
}

/// Nanoseconds since the Unix epoch. All capture timestamps use this
/// representation so that archive files round-trip without losing precision.
pub type TimeNs = i64;

pub fn now_ns() -> TimeNs {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as TimeNs,
        Err(_) => 0,
    }
}
