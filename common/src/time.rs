// Copyright (c) 2026 The Omerta Project

//! Epoch clock helpers. Envelope timestamps are millisecond precision.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_and_secs_agree() {
        let millis = now_millis();
        let secs = now_secs();
        assert!(millis / 1000 >= secs.saturating_sub(1));
        assert!(millis / 1000 <= secs + 1);
    }
}
