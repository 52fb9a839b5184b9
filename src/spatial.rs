use std::time::{SystemTime, UNIX_EPOCH};

pub mod objects;
pub mod quad_box;
pub mod region;

/// Wall clock in seconds since the unix epoch, as stored in download dates.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
