//! Engine metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! every call is a no-op.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTION_STATE_CHANGES_TOTAL: &str = "ripple_connection_state_changes_total";
    pub const CHANNEL_STATE_CHANGES_TOTAL: &str = "ripple_channel_state_changes_total";
    pub const MESSAGES_SENT_TOTAL: &str = "ripple_messages_sent_total";
    pub const MESSAGES_RECEIVED_TOTAL: &str = "ripple_messages_received_total";
    pub const ACKS_TOTAL: &str = "ripple_acks_total";
    pub const NACKS_TOTAL: &str = "ripple_nacks_total";
    pub const PENDING_ACKS: &str = "ripple_pending_acks";
    pub const QUEUED_MESSAGES: &str = "ripple_queued_messages";
    pub const PRESENCE_EVENTS_TOTAL: &str = "ripple_presence_events_total";
    pub const PING_SECONDS: &str = "ripple_ping_seconds";
    pub const COMMAND_FAILURES_TOTAL: &str = "ripple_command_failures_total";
}

/// Describe every metric to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTION_STATE_CHANGES_TOTAL,
        "Connection state transitions, by new state"
    );
    metrics::describe_counter!(
        names::CHANNEL_STATE_CHANGES_TOTAL,
        "Channel state transitions, by new state"
    );
    metrics::describe_counter!(names::MESSAGES_SENT_TOTAL, "Envelopes sent, by action");
    metrics::describe_counter!(names::MESSAGES_RECEIVED_TOTAL, "Envelopes received, by action");
    metrics::describe_counter!(names::ACKS_TOTAL, "Messages acknowledged by the service");
    metrics::describe_counter!(names::NACKS_TOTAL, "Messages rejected by the service");
    metrics::describe_gauge!(names::PENDING_ACKS, "Messages waiting for an acknowledgement");
    metrics::describe_gauge!(
        names::QUEUED_MESSAGES,
        "Messages queued until the connection is established"
    );
    metrics::describe_counter!(names::PRESENCE_EVENTS_TOTAL, "Presence events delivered, by action");
    metrics::describe_histogram!(names::PING_SECONDS, "Ping round-trip time in seconds");
    metrics::describe_counter!(names::COMMAND_FAILURES_TOTAL, "Workflow commands that failed");
}

pub fn record_connection_state(state: &'static str) {
    counter!(names::CONNECTION_STATE_CHANGES_TOTAL, "state" => state).increment(1);
}

pub fn record_channel_state(state: &'static str) {
    counter!(names::CHANNEL_STATE_CHANGES_TOTAL, "state" => state).increment(1);
}

pub fn record_sent(action: &'static str) {
    counter!(names::MESSAGES_SENT_TOTAL, "action" => action).increment(1);
}

pub fn record_received(action: &'static str) {
    counter!(names::MESSAGES_RECEIVED_TOTAL, "action" => action).increment(1);
}

pub fn record_acks(count: usize) {
    counter!(names::ACKS_TOTAL).increment(count as u64);
}

pub fn record_nacks(count: usize) {
    counter!(names::NACKS_TOTAL).increment(count as u64);
}

pub fn set_pending_acks(count: usize) {
    gauge!(names::PENDING_ACKS).set(count as f64);
}

pub fn set_queued_messages(count: usize) {
    gauge!(names::QUEUED_MESSAGES).set(count as f64);
}

pub fn record_presence_event(action: &'static str) {
    counter!(names::PRESENCE_EVENTS_TOTAL, "action" => action).increment(1);
}

pub fn record_ping(seconds: f64) {
    histogram!(names::PING_SECONDS).record(seconds);
}

pub fn record_command_failure(command: &'static str) {
    counter!(names::COMMAND_FAILURES_TOTAL, "command" => command).increment(1);
}
