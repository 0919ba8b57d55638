//! Named timers.
//!
//! A timer is addressed by its [`TimerKey`] and identified by a generation.
//! Starting a timer replaces any running timer with the same key, and a
//! `TimerFired` command whose generation is no longer current is ignored,
//! so an abort never races with an expiry already in the queue.

use crate::command::Command;
use crate::connection::ConnectionTimer;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

/// Timer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Connection(ConnectionTimer),
    Ping(u64),
    ChannelAttach(String),
    ChannelDetach(String),
    ChannelRetry(String),
}

impl TimerKey {
    /// The channel this timer belongs to, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            TimerKey::ChannelAttach(name)
            | TimerKey::ChannelDetach(name)
            | TimerKey::ChannelRetry(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct ActiveTimer {
    generation: u64,
    duration: Duration,
    task: Option<AbortHandle>,
}

impl ActiveTimer {
    fn cancel(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Running timers of one workflow.
///
/// With a tokio runtime available each timer is a task that sleeps and then
/// enqueues `TimerFired`. Without one, timers are only recorded and fire
/// when [`Workflow::expire_timer`](crate::Workflow::expire_timer) is called.
#[derive(Debug)]
pub struct Timers {
    sender: mpsc::UnboundedSender<Command>,
    next_generation: u64,
    active: HashMap<TimerKey, ActiveTimer>,
}

impl Timers {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            sender,
            next_generation: 0,
            active: HashMap::new(),
        }
    }

    /// Start `key`, replacing a running timer with the same key.
    ///
    /// Returns the new generation.
    pub fn start(&mut self, key: TimerKey, duration: Duration) -> u64 {
        self.abort(&key);
        self.next_generation += 1;
        let generation = self.next_generation;

        let task = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let sender = self.sender.clone();
            let key = key.clone();
            handle
                .spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = sender.send(Command::TimerFired { key, generation });
                })
                .abort_handle()
        });

        trace!(?key, generation, ?duration, "Timer started");
        self.active.insert(
            key,
            ActiveTimer {
                generation,
                duration,
                task,
            },
        );
        generation
    }

    /// Abort `key`. Aborting a timer that is not running does nothing.
    pub fn abort(&mut self, key: &TimerKey) -> bool {
        match self.active.remove(key) {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every timer matching `predicate`.
    pub fn abort_where(&mut self, predicate: impl Fn(&TimerKey) -> bool) {
        let keys: Vec<TimerKey> = self.active.keys().filter(|k| predicate(k)).cloned().collect();
        for key in keys {
            self.abort(&key);
        }
    }

    pub fn abort_all(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.cancel();
        }
    }

    /// Consume an expiry. Returns `false` if `generation` is stale.
    pub fn fire(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.active.get(key) {
            Some(timer) if timer.generation == generation => {
                self.active.remove(key);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_active(&self, key: &TimerKey) -> bool {
        self.active.contains_key(key)
    }

    #[must_use]
    pub fn generation(&self, key: &TimerKey) -> Option<u64> {
        self.active.get(key).map(|t| t.generation)
    }

    #[must_use]
    pub fn duration(&self, key: &TimerKey) -> Option<Duration> {
        self.active.get(key).map(|t| t.duration)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> (Timers, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Timers::new(tx), rx)
    }

    #[test]
    fn test_restart_makes_old_generation_stale() {
        let (mut timers, _rx) = timers();
        let key = TimerKey::ChannelAttach("room".into());

        let first = timers.start(key.clone(), Duration::from_secs(1));
        let second = timers.start(key.clone(), Duration::from_secs(2));
        assert_ne!(first, second);
        assert_eq!(timers.duration(&key), Some(Duration::from_secs(2)));

        assert!(!timers.fire(&key, first));
        assert!(timers.fire(&key, second));
        assert!(!timers.is_active(&key));
        assert!(!timers.fire(&key, second));
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (mut timers, _rx) = timers();
        let key = TimerKey::Connection(ConnectionTimer::Heartbeat);
        let generation = timers.start(key.clone(), Duration::from_secs(1));

        assert!(timers.abort(&key));
        assert!(!timers.abort(&key));
        assert!(!timers.fire(&key, generation));
    }

    #[test]
    fn test_abort_where_channel() {
        let (mut timers, _rx) = timers();
        timers.start(TimerKey::ChannelAttach("a".into()), Duration::from_secs(1));
        timers.start(TimerKey::ChannelRetry("a".into()), Duration::from_secs(1));
        timers.start(TimerKey::ChannelAttach("b".into()), Duration::from_secs(1));

        timers.abort_where(|k| k.channel() == Some("a"));
        assert!(!timers.is_active(&TimerKey::ChannelRetry("a".into())));
        assert!(timers.is_active(&TimerKey::ChannelAttach("b".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_enqueues_command() {
        let (mut timers, mut rx) = timers();
        let key = TimerKey::Ping(7);
        let generation = timers.start(key.clone(), Duration::from_millis(50));

        match rx.recv().await {
            Some(Command::TimerFired {
                key: fired,
                generation: g,
            }) => {
                assert_eq!(fired, key);
                assert_eq!(g, generation);
            }
            _ => panic!("expected TimerFired"),
        }
    }
}
