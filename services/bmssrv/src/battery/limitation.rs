//! Power limitation
//!
//! Producers send current limits from a named source over an unbounded
//! channel. The bus loop drains the queue once per cycle and keeps, per
//! direction, the lowest limit of all sources.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Source name under which the BMS register limits are recorded
pub const BMS_SOURCE: &str = "bms";

#[derive(Debug, Clone, PartialEq)]
pub enum LimitationEvent {
    /// Set or replace the limits of `source`, in amperes
    Set {
        source: String,
        max_charge_current: f64,
        max_discharge_current: f64,
    },
    /// Remove every limit contributed by `source`
    Clear { source: String },
}

/// Cloneable handle for sending limitation events to one device
#[derive(Debug, Clone)]
pub struct LimitationSender {
    tx: mpsc::UnboundedSender<LimitationEvent>,
}

impl LimitationSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LimitationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false when the device is gone
    pub fn set(&self, source: impl Into<String>, max_charge_current: f64, max_discharge_current: f64) -> bool {
        self.tx
            .send(LimitationEvent::Set {
                source: source.into(),
                max_charge_current,
                max_discharge_current,
            })
            .is_ok()
    }

    pub fn clear(&self, source: impl Into<String>) -> bool {
        self.tx
            .send(LimitationEvent::Clear {
                source: source.into(),
            })
            .is_ok()
    }
}

/// Effective limits published upward
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Limits {
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
}

#[derive(Debug, Default)]
pub struct PowerLimitation {
    sources: HashMap<String, Limits>,
}

impl PowerLimitation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: LimitationEvent) {
        match event {
            LimitationEvent::Set {
                source,
                max_charge_current,
                max_discharge_current,
            } => {
                let limits = Limits {
                    // Negative or NaN limits allow nothing
                    max_charge_current: sanitize(max_charge_current),
                    max_discharge_current: sanitize(max_discharge_current),
                };
                debug!("Limitation {}: {:?}", source, limits);
                self.sources.insert(source, limits);
            },
            LimitationEvent::Clear { source } => {
                self.sources.remove(&source);
            },
        }
    }

    /// Apply every queued event without waiting
    pub fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<LimitationEvent>) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Per direction minimum over all sources; zero when not ready or without sources
    pub fn effective(&self, ready: bool) -> Limits {
        if !ready || self.sources.is_empty() {
            return Limits::default();
        }
        self.sources.values().fold(
            Limits {
                max_charge_current: f64::INFINITY,
                max_discharge_current: f64::INFINITY,
            },
            |acc, l| Limits {
                max_charge_current: acc.max_charge_current.min(l.max_charge_current),
                max_discharge_current: acc.max_discharge_current.min(l.max_discharge_current),
            },
        )
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.max(0.0)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_minimum_per_direction() {
        let mut limitation = PowerLimitation::new();
        limitation.apply(LimitationEvent::Set {
            source: "bms".to_string(),
            max_charge_current: 100.0,
            max_discharge_current: 50.0,
        });
        limitation.apply(LimitationEvent::Set {
            source: "ems".to_string(),
            max_charge_current: 80.0,
            max_discharge_current: 120.0,
        });

        assert_eq!(
            limitation.effective(true),
            Limits {
                max_charge_current: 80.0,
                max_discharge_current: 50.0,
            }
        );
        assert_eq!(limitation.effective(false), Limits::default());

        limitation.apply(LimitationEvent::Clear {
            source: "ems".to_string(),
        });
        assert_eq!(limitation.effective(true).max_charge_current, 100.0);
    }

    #[test]
    fn test_no_sources_allows_nothing() {
        assert_eq!(PowerLimitation::new().effective(true), Limits::default());
    }

    #[tokio::test]
    async fn test_drain_applies_queued_events() {
        let (sender, mut rx) = LimitationSender::channel();
        assert!(sender.set("ems", 10.0, -5.0));
        assert!(sender.set("ems", 20.0, 30.0));
        assert!(sender.set("site", f64::NAN, 40.0));

        let mut limitation = PowerLimitation::new();
        assert_eq!(limitation.drain(&mut rx), 3);
        assert_eq!(limitation.source_count(), 2);
        assert_eq!(
            limitation.effective(true),
            Limits {
                max_charge_current: 0.0,
                max_discharge_current: 30.0,
            }
        );
        assert_eq!(limitation.drain(&mut rx), 0);

        drop(rx);
        assert!(!sender.clear("ems"));
    }
}
