use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_epoch_secs_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
