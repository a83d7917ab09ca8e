//! Channel tunables shared by the host listener and the worker runtime.

use std::net::IpAddr;
use std::time::Duration;

use crate::bridge::transport::LOOPBACK;

/// How often background loops wake to check their quit flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Inbound messages buffered between the transport and the dispatch loop.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// Overrides the poll interval, in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "SERVICELINK_POLL_MS";

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub bind_host: IpAddr,
    pub poll_interval: Duration,
    pub inbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bind_host: LOOPBACK,
            poll_interval: DEFAULT_POLL_INTERVAL,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the poll interval taken from `SERVICELINK_POLL_MS` when set.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(POLL_INTERVAL_ENV) {
            Ok(raw) => match parse_poll_interval(&raw) {
                Some(interval) => config.with_poll_interval(interval),
                None => {
                    tracing::warn!(
                        value = %raw,
                        "Ignoring invalid {POLL_INTERVAL_ENV}, using default"
                    );
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }
}

fn parse_poll_interval(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}
