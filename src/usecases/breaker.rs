//! Per-(rule, market) circuit breakers.
//!
//! Gates signal emission by rate: a pair whose emissions exceed
//! `max_emissions` within `window` trips OPEN for a cooldown, then probes
//! via HALF_OPEN. A successful probe closes the breaker; a probe that
//! re-trips reopens it at double the cooldown, bounded by `max_cooldown`.
//!
//! The table has a single writer (the rule-engine loop) and concurrent
//! readers (the intent confirmation path); the inner lock is held only for
//! map access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Rate and cooldown parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Emissions allowed per window before tripping.
    pub max_emissions: usize,
    /// Rate window.
    pub window: Duration,
    /// Initial OPEN duration.
    pub cooldown: Duration,
    /// Ceiling for the doubling cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_emissions: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            max_cooldown: Duration::from_secs(3600),
        }
    }
}

enum BreakerState {
    Closed {
        emissions: VecDeque<Instant>,
    },
    Open {
        until: Instant,
        cooldown: Duration,
        emissions: VecDeque<Instant>,
    },
    HalfOpen {
        cooldown: Duration,
        emissions: VecDeque<Instant>,
    },
}

/// Breaker table keyed by `(rule_id, market_id)`.
pub struct CircuitBreakerTable {
    config: BreakerConfig,
    states: Mutex<HashMap<(i64, String), BreakerState>>,
}

impl CircuitBreakerTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether emissions for this pair are currently suppressed.
    ///
    /// An expired OPEN transitions to HALF_OPEN as a side effect.
    pub fn is_open(&self, rule_id: i64, market_id: &str, now: Instant) -> bool {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        let key = (rule_id, market_id.to_string());
        match states.get_mut(&key) {
            Some(BreakerState::Open {
                until,
                cooldown,
                emissions,
            }) => {
                if now < *until {
                    true
                } else {
                    let state = BreakerState::HalfOpen {
                        cooldown: *cooldown,
                        emissions: std::mem::take(emissions),
                    };
                    states.insert(key, state);
                    false
                }
            }
            _ => false,
        }
    }

    /// Record an emission for this pair, tripping the breaker when the
    /// rate threshold is breached. Call only after an actual emission.
    pub fn record_emission(&self, rule_id: i64, market_id: &str, now: Instant) {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        let key = (rule_id, market_id.to_string());
        let state = states.remove(&key).unwrap_or(BreakerState::Closed {
            emissions: VecDeque::new(),
        });

        let next = match state {
            BreakerState::Closed { mut emissions } => {
                push_and_prune(&mut emissions, now, self.config.window);
                if emissions.len() > self.config.max_emissions {
                    warn!(rule_id, market_id, "Circuit breaker tripped");
                    BreakerState::Open {
                        until: now + self.config.cooldown,
                        cooldown: self.config.cooldown,
                        emissions,
                    }
                } else {
                    BreakerState::Closed { emissions }
                }
            }
            BreakerState::HalfOpen {
                cooldown,
                mut emissions,
            } => {
                // The single probe emission: success closes, a re-trip
                // doubles the cooldown up to the ceiling.
                push_and_prune(&mut emissions, now, self.config.window);
                if emissions.len() > self.config.max_emissions {
                    let doubled = (cooldown * 2).min(self.config.max_cooldown);
                    warn!(rule_id, market_id, "Circuit breaker re-tripped on probe");
                    BreakerState::Open {
                        until: now + doubled,
                        cooldown: doubled,
                        emissions,
                    }
                } else {
                    BreakerState::Closed { emissions }
                }
            }
            open @ BreakerState::Open { .. } => open,
        };
        states.insert(key, next);
    }
}

fn push_and_prune(emissions: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    emissions.push_back(now);
    while let Some(first) = emissions.front() {
        if now.duration_since(*first) > window {
            emissions.pop_front();
        } else {
            break;
        }
    }
}
