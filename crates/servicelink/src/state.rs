//! Channel lifecycle state for the host side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::transport::Endpoint;

/// Where a channel is in its start/stop cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelPhase {
    /// No channel task, no worker
    #[default]
    Stopped,
    /// start() in progress
    Launching,
    /// Inbound endpoint bound, worker not launched yet
    ChannelBound,
    /// Worker launched, waiting for READY
    AwaitingReady,
    /// Outbound link connected
    Ready,
    /// Commands have been sent
    Running,
    /// QUIT sent, waiting for STOPPED
    SoftQuitSent,
}

impl ChannelPhase {
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::SoftQuitSent)
    }
}

/// Set-once flags written by the channel task and read by the designated thread.
///
/// Stores use `Release` and loads `Acquire`, so a reader that observes a flag
/// also observes everything written before it was set. Nothing clears a flag
/// except [`reset`](Self::reset), which only a fresh `start()` calls.
#[derive(Debug, Default)]
pub struct ChannelFlags {
    ready: AtomicBool,
    stopped: AtomicBool,
    can_bind: AtomicBool,
    child_endpoint: Mutex<Option<Endpoint>>,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ChannelFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.ready.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
        self.can_bind.store(false, Ordering::Release);
        *self
            .child_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.notify();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn can_bind(&self) -> bool {
        self.can_bind.load(Ordering::Acquire)
    }

    pub fn child_endpoint(&self) -> Option<Endpoint> {
        *self
            .child_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.notify();
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify();
    }

    /// Record the worker's endpoint; the endpoint is visible before `can_bind` is.
    pub fn mark_can_bind(&self, endpoint: Endpoint) {
        *self
            .child_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
        self.can_bind.store(true, Ordering::Release);
        self.notify();
    }

    /// Block until any flag changes or `timeout` elapses.
    ///
    /// A change that lands just before the call is not seen; callers re-check
    /// their condition in a loop with a short timeout.
    pub fn wait_for_change(&self, timeout: Duration) {
        let guard = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seen = *guard;
        let _ = self
            .changed
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }
}

/// Snapshot of a listener for callers (UI toggles, diagnostics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub phase: ChannelPhase,
    pub ready: bool,
    pub stopped: bool,
    pub can_bind: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn phase_default_is_stopped() {
        assert_eq!(ChannelPhase::default(), ChannelPhase::Stopped);
    }

    #[test]
    fn phase_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                ChannelPhase::Stopped,
                ChannelPhase::AwaitingReady,
                ChannelPhase::SoftQuitSent,
            ],
            @r#"
        [
          "STOPPED",
          "AWAITING_READY",
          "SOFT_QUIT_SENT"
        ]
        "#
        );
    }

    #[test]
    fn phase_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<ChannelPhase>("\"CHANNEL_BOUND\"").unwrap(),
            ChannelPhase::ChannelBound
        );
    }

    #[test]
    fn only_connected_phases_can_send() {
        assert!(!ChannelPhase::AwaitingReady.can_send());
        assert!(!ChannelPhase::Stopped.can_send());
        assert!(ChannelPhase::Ready.can_send());
        assert!(ChannelPhase::Running.can_send());
    }

    #[test]
    fn flags_start_cleared_and_reset_clears_them() {
        let flags = ChannelFlags::new();
        assert!(!flags.is_ready() && !flags.is_stopped() && !flags.can_bind());

        flags.mark_can_bind(Endpoint::loopback(5000));
        flags.mark_ready();
        flags.mark_stopped();
        assert!(flags.is_ready() && flags.is_stopped() && flags.can_bind());
        assert_eq!(flags.child_endpoint(), Some(Endpoint::loopback(5000)));

        flags.reset();
        assert!(!flags.is_ready() && !flags.is_stopped() && !flags.can_bind());
        assert_eq!(flags.child_endpoint(), None);
    }

    #[test]
    fn wait_for_change_times_out() {
        let flags = ChannelFlags::new();
        let started = Instant::now();
        flags.wait_for_change(Duration::from_millis(30));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_for_change_wakes_on_set() {
        let flags = Arc::new(ChannelFlags::new());
        let setter = Arc::clone(&flags);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.mark_stopped();
        });

        let started = Instant::now();
        while !flags.is_stopped() {
            flags.wait_for_change(Duration::from_secs(5));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
