//! Edge detection for bouncy boolean signals.
//!
//! Turns raw samples (key held, match above threshold) into clean
//! `Entered`/`Exited` edges. Entry is trusted immediately; exit waits out
//! the cooldown started by the last entry and an optional inactivity delay.

use std::time::{Duration, Instant};

use crate::error::ClockAnomaly;

/// A debounced transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Entered,
    Exited,
}

/// Timing parameters for one debouncer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Minimum time between two consecutive `Entered` edges. Also holds the
    /// signal active for at least this long after entry.
    pub cooldown: Duration,
    /// Continuous inactivity required before `Exited` is delivered.
    pub exit_delay: Duration,
}

impl DebounceConfig {
    pub fn from_millis(cooldown_ms: u64, exit_delay_ms: u64) -> Self {
        Self {
            cooldown: Duration::from_millis(cooldown_ms),
            exit_delay: Duration::from_millis(exit_delay_ms),
        }
    }
}

/// Observable state of a debouncer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalState {
    /// Last raw sample
    pub raw: bool,
    /// Debounced output
    pub debounced: bool,
    pub last_edge_at: Option<Instant>,
    pub cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct SignalDebouncer {
    config: DebounceConfig,
    state: SignalState,
    /// Start of the current run of inactive samples while debounced
    inactive_since: Option<Instant>,
    last_sample_at: Option<Instant>,
}

impl SignalDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: SignalState::default(),
            inactive_since: None,
            last_sample_at: None,
        }
    }

    pub fn state(&self) -> &SignalState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.debounced
    }

    /// Feeds one raw sample.
    ///
    /// A timestamp earlier than the previous sample leaves the state
    /// untouched and is reported as a `ClockAnomaly`.
    pub fn sample(&mut self, raw_active: bool, now: Instant) -> Result<Option<Edge>, ClockAnomaly> {
        self.check_clock(now)?;
        self.last_sample_at = Some(now);

        if raw_active {
            self.inactive_since = None;
        } else if self.state.raw || self.inactive_since.is_none() {
            self.inactive_since = Some(now);
        }
        self.state.raw = raw_active;

        Ok(self.evaluate(now))
    }

    /// Re-evaluates the last raw sample at `now`, delivering edges that were
    /// held back by a cooldown or exit delay.
    ///
    /// Polling is not a sample: it never moves the clock used for anomaly
    /// checks, and a `now` before the last sample does nothing.
    pub fn poll(&mut self, now: Instant) -> Option<Edge> {
        if self.last_sample_at.is_some_and(|last| now < last) {
            return None;
        }
        self.evaluate(now)
    }

    /// Earliest instant at which `poll` could produce an edge, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.state.raw, self.state.debounced) {
            // Waiting for the entry cooldown to end
            (true, false) => self.state.cooldown_until,
            // Waiting for the exit delay and cooldown to end
            (false, true) => {
                let exit_at = self.inactive_since? + self.config.exit_delay;
                Some(match self.state.cooldown_until {
                    Some(cooldown) => exit_at.max(cooldown),
                    None => exit_at,
                })
            }
            _ => None,
        }
    }

    /// Clears all state, as at monitoring start.
    pub fn reset(&mut self) {
        self.state = SignalState::default();
        self.inactive_since = None;
        self.last_sample_at = None;
    }

    fn check_clock(&self, now: Instant) -> Result<(), ClockAnomaly> {
        match self.last_sample_at {
            Some(previous) if now < previous => Err(ClockAnomaly {
                previous,
                observed: now,
            }),
            _ => Ok(()),
        }
    }

    fn evaluate(&mut self, now: Instant) -> Option<Edge> {
        let in_cooldown = self.state.cooldown_until.is_some_and(|until| now < until);

        if self.state.raw {
            if self.state.debounced || in_cooldown {
                return None;
            }
            self.state.debounced = true;
            self.state.last_edge_at = Some(now);
            self.state.cooldown_until = Some(now + self.config.cooldown);
            return Some(Edge::Entered);
        }

        if !self.state.debounced || in_cooldown {
            return None;
        }
        let inactive_for = now.saturating_duration_since(self.inactive_since.unwrap_or(now));
        if inactive_for < self.config.exit_delay {
            return None;
        }
        self.state.debounced = false;
        self.state.last_edge_at = Some(now);
        self.inactive_since = None;
        Some(Edge::Exited)
    }
}
