use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current wall-clock timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let a = get_timestamp();
        std::thread::sleep(Duration::from_millis(2));
        let b = get_timestamp();
        assert!(b > a);
    }
}
