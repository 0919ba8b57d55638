//! Fallback host selection.
//!
//! When a connection attempt to the primary host fails in a way another
//! host might not, the next attempt goes to a fallback host. Fallbacks are
//! tried in a random order, each at most once per cycle.

use rand::seq::SliceRandom;
use ripple_protocol::ErrorInfo;

/// Primary host plus an ordered pool of fallbacks.
#[derive(Debug, Clone)]
pub struct FallbackHosts {
    primary: String,
    fallbacks: Vec<String>,
    remaining: Vec<String>,
    current: String,
}

impl FallbackHosts {
    /// Create a host set. Fallbacks equal to the primary are ignored.
    #[must_use]
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        let primary = primary.into();
        let fallbacks: Vec<String> = fallbacks.into_iter().filter(|h| *h != primary).collect();
        let mut hosts = Self {
            current: primary.clone(),
            primary,
            fallbacks,
            remaining: Vec::new(),
        };
        hosts.reset();
        hosts
    }

    /// The host the next connection attempt should use.
    #[must_use]
    pub fn current(&self) -> &str {
        &self.current
    }

    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Go back to the primary host and refill the fallback pool.
    pub fn reset(&mut self) {
        self.current = self.primary.clone();
        self.remaining = self.fallbacks.clone();
        self.remaining.shuffle(&mut rand::thread_rng());
    }

    /// Move to the next untried fallback host.
    ///
    /// Returns `None` once every fallback has been tried this cycle.
    pub fn advance(&mut self) -> Option<&str> {
        let next = self.remaining.pop()?;
        self.current = next;
        Some(&self.current)
    }

    /// Whether a failure with this error should be retried on another host:
    /// network failures (no error, or status 0) and 5xx responses.
    #[must_use]
    pub fn should_use_fallback(error: Option<&ErrorInfo>) -> bool {
        match error {
            None => true,
            Some(e) => e.status_code == 0 || e.is_server_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_each_fallback_tried_once() {
        let mut hosts = FallbackHosts::new(
            "main.example.com",
            vec![
                "a.example.com".into(),
                "b.example.com".into(),
                "main.example.com".into(),
            ],
        );
        assert_eq!(hosts.current(), "main.example.com");

        let mut tried = HashSet::new();
        while let Some(host) = hosts.advance() {
            tried.insert(host.to_string());
        }
        assert_eq!(tried.len(), 2);
        assert!(tried.contains("a.example.com"));
        assert!(!tried.contains("main.example.com"));

        hosts.reset();
        assert_eq!(hosts.current(), "main.example.com");
        assert!(hosts.advance().is_some());
    }

    #[test]
    fn test_should_use_fallback() {
        assert!(FallbackHosts::should_use_fallback(None));
        assert!(FallbackHosts::should_use_fallback(Some(&ErrorInfo::new(80003, 0, ""))));
        assert!(FallbackHosts::should_use_fallback(Some(&ErrorInfo::new(50000, 503, ""))));
        assert!(!FallbackHosts::should_use_fallback(Some(&ErrorInfo::new(40142, 401, ""))));
    }
}
