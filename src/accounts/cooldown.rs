use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-process guard against hammering upstream with account connectivity
/// tests. Best-effort: the window is not shared across processes.
pub struct TestCooldown {
    window: Duration,
    last_test: Mutex<HashMap<i64, Instant>>,
}

impl TestCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_test: Mutex::new(HashMap::new()),
        }
    }

    /// Record a test attempt. `Err(remaining)` when the account was tested
    /// within the cooldown window.
    pub fn try_begin(&self, account_id: i64) -> Result<(), Duration> {
        let now = Instant::now();
        let mut map = self.last_test.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(last) = map.get(&account_id) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.window {
                return Err(self.window - elapsed);
            }
        }
        map.insert(account_id, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_test_within_window_is_rejected() {
        let cooldown = TestCooldown::new(Duration::from_secs(10));
        assert!(cooldown.try_begin(1).is_ok());

        let remaining = cooldown.try_begin(1).unwrap_err();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(8));

        // A different account is unaffected.
        assert!(cooldown.try_begin(2).is_ok());
    }

    #[test]
    fn window_expiry_allows_retest() {
        let cooldown = TestCooldown::new(Duration::from_millis(20));
        assert!(cooldown.try_begin(1).is_ok());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cooldown.try_begin(1).is_ok());
    }
}
