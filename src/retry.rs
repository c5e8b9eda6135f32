//! Retry/backoff policy objects (§2 C15, SPEC_FULL). Grounded in
//! `client::Config`'s `seconds_between_reconnections`/
//! `max_connection_retries`/`max_server_error_retries` and the `tries`
//! counter driving `client::ProtocolManager`'s reconnection loop in the
//! original `main.cpp` — pulled out of the session engine and the
//! daemon's main loop into one small owned counter each, rather than two
//! raw `u32`s threaded by hand.

use std::time::Duration;

/// Governs how many times the client daemon redials the server after a
/// transient connection failure, and how long it waits between attempts
/// (§4.7 "Idle disconnect" / §5 "Timeouts").
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    backoff: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(backoff: Duration, max_attempts: u32) -> Self {
        Self { backoff, max_attempts, attempts: 0 }
    }

    /// Call once after a connection attempt fails. Returns `true` if
    /// another attempt should be made (and sleeps `backoff` first),
    /// `false` once `max_attempts` is exceeded.
    pub fn record_failure_and_retry(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            return false;
        }
        std::thread::sleep(self.backoff);
        true
    }

    /// Call once a connection attempt succeeds, so a later unrelated
    /// failure starts counting from zero again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Governs how many times the client retries the same head-of-window
/// request after a recoverable server error before elevating it to fatal
/// (§4.7 response handling, `R_err`).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_tries: u32,
    tries: u32,
}

impl RetryPolicy {
    pub fn new(max_tries: u32) -> Self {
        Self { max_tries, tries: 0 }
    }

    /// Records one recoverable-error response for the current head entry.
    /// Returns `true` if a rewind should be attempted, `false` once
    /// `max_tries` is exceeded (the caller then elevates to fatal).
    pub fn record_error_and_retry(&mut self) -> bool {
        self.tries += 1;
        self.tries <= self.max_tries
    }

    /// Call on any successful response, so the next recoverable error for
    /// a different entry starts counting from zero.
    pub fn reset(&mut self) {
        self.tries = 0;
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_policy_allows_up_to_max_attempts() {
        let mut p = ReconnectPolicy::new(Duration::from_millis(1), 2);
        assert!(p.record_failure_and_retry());
        assert!(p.record_failure_and_retry());
        assert!(!p.record_failure_and_retry());
    }

    #[test]
    fn reconnect_policy_reset_restarts_the_count() {
        let mut p = ReconnectPolicy::new(Duration::from_millis(1), 1);
        assert!(p.record_failure_and_retry());
        p.reset();
        assert!(p.record_failure_and_retry());
    }

    #[test]
    fn retry_policy_elevates_to_fatal_after_max_tries() {
        let mut p = RetryPolicy::new(2);
        assert!(p.record_error_and_retry());
        assert!(p.record_error_and_retry());
        assert!(!p.record_error_and_retry());
    }

    #[test]
    fn retry_policy_reset_on_success() {
        let mut p = RetryPolicy::new(1);
        assert!(p.record_error_and_retry());
        p.reset();
        assert!(p.record_error_and_retry());
    }
}
