//! One monitoring run: two debouncers feeding the scene arbiter.
//!
//! Created when monitoring starts and dropped when it stops, so every run
//! begins from `Live` with clean signal state.

use std::time::{Duration, Instant};

use super::arbiter::{ArbiterEvent, ArbiterNotice, ArbiterState, SceneArbiter, SceneSink};
use crate::config::AppConfig;
use crate::detection::{DebounceConfig, Edge, MatchResult, SignalDebouncer};
use crate::error::ClockAnomaly;

#[derive(Debug)]
pub struct MonitoringSession {
    arbiter: SceneArbiter,
    map: SignalDebouncer,
    death: SignalDebouncer,
    threshold_percent: u8,
}

impl MonitoringSession {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            arbiter: SceneArbiter::new(
                config.scenes.clone(),
                Duration::from_millis(config.map_key.respawn_delay_ms),
            ),
            map: SignalDebouncer::new(DebounceConfig::from_millis(
                config.map_key.cooldown_ms,
                config.map_key.exit_delay_ms,
            )),
            death: SignalDebouncer::new(DebounceConfig::from_millis(
                config.detection.cooldown_ms,
                config.detection.exit_delay_ms,
            )),
            threshold_percent: config.detection.threshold_percent,
        }
    }

    /// Picks up scene names, respawn delay and threshold from a new config.
    /// Debouncer timings apply from the next session.
    pub fn apply_config(&mut self, config: &AppConfig) {
        self.arbiter.set_scenes(config.scenes.clone());
        self.arbiter
            .set_respawn_delay(Duration::from_millis(config.map_key.respawn_delay_ms));
        self.threshold_percent = config.detection.threshold_percent;
    }

    pub fn arbiter_state(&self) -> &ArbiterState {
        self.arbiter.state()
    }

    pub fn death_active(&self) -> bool {
        self.death.is_active()
    }

    /// Feeds one map-key sample.
    pub fn on_key_sample(
        &mut self,
        held: bool,
        at: Instant,
        sink: &mut dyn SceneSink,
    ) -> Result<Vec<ArbiterNotice>, ClockAnomaly> {
        let edge = self.map.sample(held, at)?;
        Ok(self.dispatch(edge.map(map_event), at, sink))
    }

    /// Feeds one scored frame. Scores at or above the threshold count as
    /// the death screen being visible.
    pub fn on_match(
        &mut self,
        result: MatchResult,
        sink: &mut dyn SceneSink,
    ) -> Result<Vec<ArbiterNotice>, ClockAnomaly> {
        let raw = result.exceeds(self.threshold_percent);
        let edge = self.death.sample(raw, result.at)?;
        Ok(self.dispatch(edge.map(death_event), result.at, sink))
    }

    /// Delivers edges and transitions whose deadline has passed.
    pub fn tick(&mut self, now: Instant, sink: &mut dyn SceneSink) -> Vec<ArbiterNotice> {
        let mut notices = Vec::new();
        if let Some(edge) = self.map.poll(now) {
            notices.extend(self.arbiter.handle(map_event(edge), now, sink));
        }
        if let Some(edge) = self.death.poll(now) {
            notices.extend(self.arbiter.handle(death_event(edge), now, sink));
        }
        notices.extend(self.arbiter.poll(now, sink));
        notices
    }

    /// The earliest instant `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.map.next_deadline(),
            self.death.next_deadline(),
            self.arbiter.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn dispatch(
        &mut self,
        event: Option<ArbiterEvent>,
        at: Instant,
        sink: &mut dyn SceneSink,
    ) -> Vec<ArbiterNotice> {
        match event {
            Some(event) => self.arbiter.handle(event, at, sink),
            None => self.arbiter.poll(at, sink),
        }
    }
}

fn map_event(edge: Edge) -> ArbiterEvent {
    match edge {
        Edge::Entered => ArbiterEvent::MapEntered,
        Edge::Exited => ArbiterEvent::MapExited,
    }
}

fn death_event(edge: Edge) -> ArbiterEvent {
    match edge {
        Edge::Entered => ArbiterEvent::DeathEntered,
        Edge::Exited => ArbiterEvent::DeathExited,
    }
}
