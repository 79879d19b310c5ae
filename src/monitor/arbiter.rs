//! Scene arbitration state machine.
//!
//! Reconciles the map-key edge stream and the death-detection edge stream
//! into scene switches: Live → Map on key down, Map → Live after the respawn
//! delay on key up, anything → Death on detection, Death → Live when the
//! death screen clears. Death always wins over the map key.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::SceneNames;
use crate::error::SwitchError;

/// The three scenes the arbiter chooses between.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneRole {
    #[default]
    Live,
    Map,
    Death,
}

impl std::fmt::Display for SceneRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneRole::Live => write!(f, "Live"),
            SceneRole::Map => write!(f, "Map"),
            SceneRole::Death => write!(f, "Death"),
        }
    }
}

/// Debounced edges fed into the arbiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbiterEvent {
    MapEntered,
    MapExited,
    DeathEntered,
    DeathExited,
}

/// Where scene switches go. Implemented by the OBS client.
pub trait SceneSink {
    fn switch_to(&mut self, scene: &str) -> Result<(), SwitchError>;
}

/// A delayed transition waiting for its deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTransition {
    pub target: SceneRole,
    pub not_before: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArbiterState {
    /// Role of the last committed transition
    pub current_role: SceneRole,
    pub pending: Option<PendingTransition>,
    pub map_signal_active: bool,
    pub death_signal_active: bool,
}

/// What a call to the arbiter did, for status reporting.
#[derive(Clone, Debug, PartialEq)]
pub enum ArbiterNotice {
    /// Transition committed and OBS accepted the switch
    Switched { role: SceneRole, scene: String },
    /// Transition committed but the switch failed. The role is kept.
    SwitchFailed {
        role: SceneRole,
        scene: String,
        error: String,
    },
    /// Transition committed but no scene is assigned to the role
    Unassigned { role: SceneRole },
    Scheduled { role: SceneRole, at: Instant },
    Cancelled { role: SceneRole },
    Ignored {
        event: ArbiterEvent,
        reason: &'static str,
    },
}

impl std::fmt::Display for ArbiterNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArbiterNotice::Switched { role, scene } => {
                write!(f, "Switched to {} scene \"{}\"", role, scene)
            }
            ArbiterNotice::SwitchFailed { role, scene, error } => write!(
                f,
                "Failed to switch to {} scene \"{}\": {}",
                role, scene, error
            ),
            ArbiterNotice::Unassigned { role } => {
                write!(f, "Now {} but no scene is assigned to it", role)
            }
            ArbiterNotice::Scheduled { role, .. } => write!(f, "Return to {} scheduled", role),
            ArbiterNotice::Cancelled { role } => write!(f, "Pending return to {} cancelled", role),
            ArbiterNotice::Ignored { event, reason } => {
                write!(f, "{:?} ignored: {}", event, reason)
            }
        }
    }
}

/// The arbiter. Not reentrant: callers serialize events through `&mut self`.
#[derive(Debug)]
pub struct SceneArbiter {
    state: ArbiterState,
    scenes: SceneNames,
    respawn_delay: Duration,
}

impl SceneArbiter {
    pub fn new(scenes: SceneNames, respawn_delay: Duration) -> Self {
        Self {
            state: ArbiterState::default(),
            scenes,
            respawn_delay,
        }
    }

    pub fn state(&self) -> &ArbiterState {
        &self.state
    }

    pub fn current_role(&self) -> SceneRole {
        self.state.current_role
    }

    /// Replaces the role → scene name mapping. Takes effect on the next
    /// committed transition.
    pub fn set_scenes(&mut self, scenes: SceneNames) {
        self.scenes = scenes;
    }

    pub fn set_respawn_delay(&mut self, delay: Duration) {
        self.respawn_delay = delay;
    }

    /// Deadline of the pending transition, if one is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.pending.map(|p| p.not_before)
    }

    /// Back to `Live` with nothing pending. Sends nothing.
    pub fn reset(&mut self) {
        self.state = ArbiterState::default();
    }

    /// Commits a pending transition whose deadline has passed.
    pub fn poll(&mut self, now: Instant, sink: &mut dyn SceneSink) -> Vec<ArbiterNotice> {
        let mut notices = Vec::new();
        self.fire_due(now, sink, &mut notices);
        notices
    }

    /// Processes one event to completion.
    pub fn handle(
        &mut self,
        event: ArbiterEvent,
        now: Instant,
        sink: &mut dyn SceneSink,
    ) -> Vec<ArbiterNotice> {
        let mut notices = Vec::new();
        // A due transition happened before this event did
        self.fire_due(now, sink, &mut notices);

        let ignored = |reason| ArbiterNotice::Ignored { event, reason };
        let current = self.state.current_role;

        match event {
            ArbiterEvent::MapEntered => {
                self.state.map_signal_active = true;
                if current == SceneRole::Death {
                    notices.push(ignored("map key is inert while on the death scene"));
                } else if self.state.pending.is_some() {
                    notices.push(ignored("return to live is pending"));
                } else if current == SceneRole::Map {
                    notices.push(ignored("already on the map scene"));
                } else {
                    notices.push(self.commit(SceneRole::Map, sink));
                }
            }

            ArbiterEvent::MapExited => {
                self.state.map_signal_active = false;
                if current == SceneRole::Death {
                    notices.push(ignored("map key is inert while on the death scene"));
                } else if current != SceneRole::Map {
                    notices.push(ignored("not on the map scene"));
                } else if self.state.pending.is_some() {
                    notices.push(ignored("return to live is already pending"));
                } else {
                    let at = now + self.respawn_delay;
                    self.state.pending = Some(PendingTransition {
                        target: SceneRole::Live,
                        not_before: at,
                    });
                    notices.push(ArbiterNotice::Scheduled {
                        role: SceneRole::Live,
                        at,
                    });
                    self.fire_due(now, sink, &mut notices);
                }
            }

            ArbiterEvent::DeathEntered => {
                self.state.death_signal_active = true;
                if current == SceneRole::Death {
                    notices.push(ignored("already on the death scene"));
                } else {
                    if let Some(pending) = self.state.pending.take() {
                        notices.push(ArbiterNotice::Cancelled {
                            role: pending.target,
                        });
                    }
                    notices.push(self.commit(SceneRole::Death, sink));
                }
            }

            ArbiterEvent::DeathExited => {
                self.state.death_signal_active = false;
                if current == SceneRole::Death {
                    notices.push(self.commit(SceneRole::Live, sink));
                } else {
                    notices.push(ignored("not on the death scene"));
                }
            }
        }

        notices
    }

    fn fire_due(&mut self, now: Instant, sink: &mut dyn SceneSink, notices: &mut Vec<ArbiterNotice>) {
        if let Some(pending) = self.state.pending {
            if now >= pending.not_before {
                self.state.pending = None;
                notices.push(self.commit(pending.target, sink));
            }
        }
    }

    /// Moves to `role` and issues exactly one switch for it.
    fn commit(&mut self, role: SceneRole, sink: &mut dyn SceneSink) -> ArbiterNotice {
        self.state.current_role = role;
        let Some(scene) = self.scenes.name_for(role) else {
            return ArbiterNotice::Unassigned { role };
        };
        let scene = scene.to_string();
        match sink.switch_to(&scene) {
            Ok(()) => ArbiterNotice::Switched { role, scene },
            Err(e) => ArbiterNotice::SwitchFailed {
                role,
                scene,
                error: e.to_string(),
            },
        }
    }
}
