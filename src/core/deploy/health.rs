//! Post-deploy health verification.

use reqwest::blocking::Client;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::interrupt;
use crate::utils::http;

pub trait HealthProbe {
    /// One probe attempt; `Err` carries a human-readable reason.
    fn check(&self, url: &str) -> std::result::Result<(), String>;
}

/// GET the endpoint and accept any 2xx.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http::client(timeout_secs)?,
        })
    }
}

impl HealthProbe for HttpProbe {
    fn check(&self, url: &str) -> std::result::Result<(), String> {
        let status = http::get_status(&self.client, url)?;
        if http::is_success(status) {
            Ok(())
        } else {
            Err(format!("HTTP {}", status))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Probe sequentially until healthy or out of attempts, sleeping a fixed backoff in between.
///
/// Returns the number of attempts used.
pub fn wait_healthy(probe: &dyn HealthProbe, url: &str, policy: RetryPolicy) -> Result<u32> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        interrupt::check("health check")?;
        match probe.check(url) {
            Ok(()) => {
                log_status!("health", "{} healthy (attempt {}/{})", url, attempt, attempts);
                return Ok(attempt);
            }
            Err(reason) => {
                log_status!("health", "Attempt {}/{} failed: {}", attempt, attempts, reason);
                last_error = reason;
            }
        }
        if attempt < attempts && !policy.backoff.is_zero() {
            thread::sleep(policy.backoff);
        }
    }

    Err(Error::health_check_failed(url, attempts, last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::cell::Cell;

    struct FlakyProbe {
        failures_before_success: u32,
        calls: Cell<u32>,
    }

    impl HealthProbe for FlakyProbe {
        fn check(&self, _url: &str) -> std::result::Result<(), String> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() > self.failures_before_success {
                Ok(())
            } else {
                Err("HTTP 503".to_string())
            }
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let probe = FlakyProbe {
            failures_before_success: 2,
            calls: Cell::new(0),
        };
        assert_eq!(wait_healthy(&probe, "http://x/health", policy(5)).unwrap(), 3);
    }

    #[test]
    fn exhausting_retries_is_health_failure() {
        let probe = FlakyProbe {
            failures_before_success: u32::MAX,
            calls: Cell::new(0),
        };
        let err = wait_healthy(&probe, "http://x/health", policy(3)).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeployHealthCheckFailed);
        assert_eq!(err.details["attempts"], 3);
        assert_eq!(err.details["last_error"], "HTTP 503");
        assert_eq!(probe.calls.get(), 3);
    }

    #[test]
    fn http_probe_reports_unreachable_host() {
        let probe = HttpProbe::new(1).unwrap();
        assert!(probe.check("http://127.0.0.1:9/health").is_err());
    }
}
