//! Outbound serial assignment and Ack/Nack correlation.
//!
//! Every `Message` or `Presence` envelope sent takes the next `msgSerial`
//! and waits in an ordered queue until an `Ack` or `Nack` covering its serial
//! arrives, or until the connection gives up on it.

use ripple_protocol::{ErrorInfo, ProtocolMessage};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Completion callback for an operation that succeeds or fails once.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), ErrorInfo>) + Send>;

/// Invoke an optional callback.
pub(crate) fn complete(callback: Option<CompletionCallback>, result: Result<(), ErrorInfo>) {
    if let Some(callback) = callback {
        callback(result);
    }
}

/// An envelope held back until it can be sent.
pub struct QueuedMessage {
    pub message: ProtocolMessage,
    pub callback: Option<CompletionCallback>,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(message: ProtocolMessage, callback: Option<CompletionCallback>) -> Self {
        Self { message, callback }
    }

    /// Complete the callback with `error`.
    pub fn fail(self, error: &ErrorInfo) {
        complete(self.callback, Err(error.clone()));
    }
}

impl std::fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("action", &self.message.action)
            .field("channel", &self.message.channel)
            .finish()
    }
}

/// A sent envelope waiting for its acknowledgement.
pub struct PendingAck {
    pub serial: i64,
    pub message: ProtocolMessage,
    callback: Option<CompletionCallback>,
}

impl PendingAck {
    fn finish(self, result: Result<(), ErrorInfo>) {
        complete(self.callback, result);
    }
}

impl std::fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAck")
            .field("serial", &self.serial)
            .field("action", &self.message.action)
            .finish()
    }
}

/// The ack-wait queue together with the serial counter.
#[derive(Debug, Default)]
pub struct AckQueue {
    msg_serial: i64,
    pending: VecDeque<PendingAck>,
}

impl AckQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The serial the next acknowledged send will take.
    #[must_use]
    pub fn msg_serial(&self) -> i64 {
        self.msg_serial
    }

    /// Seed the counter, e.g. from a recovery key.
    pub fn set_msg_serial(&mut self, serial: i64) {
        self.msg_serial = serial;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Stamp `message` with the next serial if its action needs one and
    /// record it as pending.
    ///
    /// Returns the envelope to put on the wire. Actions that are not
    /// acknowledged complete their callback immediately.
    pub fn track(
        &mut self,
        mut message: ProtocolMessage,
        callback: Option<CompletionCallback>,
    ) -> ProtocolMessage {
        if !message.requires_ack() {
            complete(callback, Ok(()));
            return message;
        }

        let serial = self.msg_serial;
        self.msg_serial += 1;
        message.msg_serial = Some(serial);
        trace!(serial, action = ?message.action, "Awaiting ack");

        self.pending.push_back(PendingAck {
            serial,
            message: message.clone(),
            callback,
        });
        message
    }

    /// Complete `[serial, serial + count)` with success.
    ///
    /// Returns the number of entries completed.
    pub fn on_ack(&mut self, serial: i64, count: i64) -> usize {
        self.settle(serial, count, Ok(()))
    }

    /// Complete `[serial, serial + count)` with `error`.
    pub fn on_nack(&mut self, serial: i64, count: i64, error: ErrorInfo) -> usize {
        self.settle(serial, count, Err(error))
    }

    fn settle(&mut self, serial: i64, count: i64, result: Result<(), ErrorInfo>) -> usize {
        let end = serial.saturating_add(count.max(0));

        // Entries older than the range will never be acknowledged.
        while self.pending.front().is_some_and(|p| p.serial < serial) {
            if let Some(skipped) = self.pending.pop_front() {
                let serial = skipped.serial;
                warn!(serial, "No acknowledgement received for message");
                skipped.finish(Err(ErrorInfo::internal(format!(
                    "No acknowledgement received for message serial {serial}"
                ))));
            }
        }

        let mut completed = 0;
        while self.pending.front().is_some_and(|p| p.serial < end) {
            if let Some(entry) = self.pending.pop_front() {
                entry.finish(result.clone());
                completed += 1;
            }
        }
        completed
    }

    /// Fail every pending entry with `error`, keeping the counter.
    pub fn fail_all(&mut self, error: &ErrorInfo) -> usize {
        let count = self.pending.len();
        for entry in self.pending.drain(..) {
            entry.finish(Err(error.clone()));
        }
        count
    }

    /// Fail every pending entry and restart serials at 0.
    pub fn reset(&mut self, error: &ErrorInfo) -> usize {
        self.msg_serial = 0;
        self.fail_all(error)
    }

    /// Pending envelopes in serial order, for resending after a resume.
    #[must_use]
    pub fn pending_messages(&self) -> Vec<ProtocolMessage> {
        self.pending.iter().map(|p| p.message.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_protocol::{Action, Message};
    use std::sync::{Arc, Mutex};

    type Results = Arc<Mutex<Vec<Result<(), ErrorInfo>>>>;

    fn recorder(results: &Results) -> Option<CompletionCallback> {
        let results = results.clone();
        Some(Box::new(move |r| results.lock().unwrap().push(r)))
    }

    fn publish() -> ProtocolMessage {
        ProtocolMessage::message("room", vec![Message::new("e", serde_json::json!(1))])
    }

    #[test]
    fn test_serials_only_for_acked_actions() {
        let mut queue = AckQueue::new();
        let results = Results::default();

        let a = queue.track(publish(), recorder(&results));
        let attach = queue.track(ProtocolMessage::attach("room"), recorder(&results));
        let b = queue.track(ProtocolMessage::presence("room", vec![]), None);
        let c = queue.track(publish(), None);

        assert_eq!(a.msg_serial, Some(0));
        assert_eq!(attach.msg_serial, None);
        assert_eq!(b.msg_serial, Some(1));
        assert_eq!(c.msg_serial, Some(2));
        assert_eq!(queue.len(), 3);
        // the attach completes immediately
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ack_completes_range_in_order() {
        let mut queue = AckQueue::new();
        let results = Results::default();
        for _ in 0..3 {
            queue.track(publish(), recorder(&results));
        }

        assert_eq!(queue.on_ack(0, 3), 3);
        assert!(queue.is_empty());
        assert_eq!(*results.lock().unwrap(), vec![Ok(()), Ok(()), Ok(())]);
    }

    #[test]
    fn test_nack_fails_range_with_error() {
        let mut queue = AckQueue::new();
        let results = Results::default();
        for _ in 0..3 {
            queue.track(publish(), recorder(&results));
        }

        let err = ErrorInfo::new(40000, 400, "rejected");
        assert_eq!(queue.on_nack(0, 3, err.clone()), 3);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.as_ref().unwrap_err() == &err));
    }

    #[test]
    fn test_partial_ack_and_skipped_entries() {
        let mut queue = AckQueue::new();
        let results = Results::default();
        for _ in 0..4 {
            queue.track(publish(), recorder(&results));
        }

        assert_eq!(queue.on_ack(1, 2), 2);
        assert_eq!(queue.len(), 1);
        let results = results.lock().unwrap();
        let skipped = results[0].as_ref().unwrap_err();
        assert!(skipped.message.contains("serial 0"));
        assert_eq!(results[1..], [Ok(()), Ok(())]);
        assert_eq!(queue.pending_messages()[0].msg_serial, Some(3));
    }

    #[test]
    fn test_reset_and_fail_all() {
        let mut queue = AckQueue::new();
        let results = Results::default();
        queue.track(publish(), recorder(&results));
        queue.track(publish(), recorder(&results));

        assert_eq!(queue.fail_all(&ErrorInfo::connection_suspended()), 2);
        assert_eq!(queue.msg_serial(), 2);

        queue.track(publish(), recorder(&results));
        queue.reset(&ErrorInfo::unable_to_recover());
        assert_eq!(queue.msg_serial(), 0);
        assert_eq!(results.lock().unwrap().len(), 3);
        assert_eq!(queue.track(publish(), None).msg_serial, Some(0));
        assert_eq!(queue.pending_messages()[0].action, Action::Message);
    }
}
