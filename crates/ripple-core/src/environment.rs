//! Clock and network state the engine depends on.
//!
//! Both are injectable so tests can control time and connectivity.

use crate::command::Command;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Turns network reachability notifications into workflow commands.
///
/// Clones share state; the workflow binds its command queue on creation.
#[derive(Clone, Default)]
pub struct NetworkMonitor {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    available: Arc<AtomicBool>,
}

impl fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("available", &self.is_available())
            .finish()
    }
}

impl NetworkMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sender: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn bind(&self, sender: mpsc::UnboundedSender<Command>) {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// The network became reachable.
    pub fn notify_available(&self) {
        self.available.store(true, Ordering::SeqCst);
        self.send(Command::NetworkAvailable);
    }

    /// The network became unreachable.
    pub fn notify_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.send(Command::NetworkUnavailable);
    }

    fn send(&self, command: Command) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => {
                let _ = sender.send(command);
            }
            None => debug!("Network notification before the client was built"),
        }
    }
}

/// Clock and network collaborators of one client.
#[derive(Clone)]
pub struct Environment {
    pub clock: Arc<dyn Clock>,
    pub network: NetworkMonitor,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            network: NetworkMonitor::new(),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("now", &self.clock.now_millis())
            .field("network", &self.network)
            .finish()
    }
}

impl Environment {
    /// An environment driven by a manual clock starting at `start_millis`.
    #[must_use]
    pub fn manual(start_millis: i64) -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_millis));
        let env = Self {
            clock: clock.clone(),
            network: NetworkMonitor::new(),
        };
        (env, clock)
    }

    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let (env, clock) = Environment::manual(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(env.now_millis(), 1_250);
        clock.set(5);
        assert_eq!(env.now_millis(), 5);
    }

    #[test]
    fn test_network_notifications_become_commands() {
        let monitor = NetworkMonitor::new();
        monitor.notify_unavailable();
        assert!(!monitor.is_available());

        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.bind(tx);
        monitor.clone().notify_available();

        assert!(monitor.is_available());
        assert!(matches!(rx.try_recv(), Ok(Command::NetworkAvailable)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
