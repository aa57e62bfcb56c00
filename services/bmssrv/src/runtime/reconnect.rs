//! Reconnection backoff
//!
//! Exponential backoff with jitter between connection attempts. The bridge
//! asks [`ReconnectHelper::ready`] once per cycle instead of sleeping, so a
//! dead bus never stalls the cycle loop.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::config::ReconnectConfig;

/// Connection state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// Waiting for the backoff to elapse after a failed attempt
    Backoff,
}

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: true,
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_connected: Option<Instant>,
}

#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Failed attempts since the last successful connect
    failures: u32,
    next_attempt: Option<Instant>,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
            next_attempt: None,
            stats: ReconnectStats::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Whether a connection attempt may be made at `now`
    pub fn ready(&self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Connected => false,
            ConnectionState::Disconnected => true,
            ConnectionState::Backoff => self.next_attempt.map(|t| now >= t).unwrap_or(true),
        }
    }

    pub fn mark_connected(&mut self, now: Instant) {
        if self.stats.total_attempts > 0 {
            self.stats.successful_reconnects += 1;
        }
        self.stats.total_attempts += 1;
        self.stats.last_connected = Some(now);
        self.state = ConnectionState::Connected;
        self.failures = 0;
        self.next_attempt = None;
        debug!("Connection marked as successful");
    }

    /// Lost an established connection; the next attempt may start immediately
    pub fn mark_disconnected(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            debug!("Connection marked as disconnected");
        }
    }

    /// A connection attempt failed at `now`; schedules the next one
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.stats.total_attempts += 1;
        self.stats.failed_reconnects += 1;
        self.failures = self.failures.saturating_add(1);

        let delay = self.calculate_next_delay();
        self.state = ConnectionState::Backoff;
        self.next_attempt = Some(now + delay);
        info!(
            "Connection attempt {} failed, next attempt in {:?}",
            self.failures, delay
        );
        delay
    }

    /// Exponential backoff: initial_delay * multiplier^(failures - 1), capped
    fn calculate_next_delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(32) as i32;
        let factor = self.policy.backoff_multiplier.powi(exponent);
        let max = self.policy.max_delay.as_secs_f64();
        let mut delay = Duration::from_secs_f64((self.policy.initial_delay.as_secs_f64() * factor).min(max));

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }
}
