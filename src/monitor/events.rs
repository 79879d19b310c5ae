//! Messages between the GUI, the control thread and its workers.
//!
//! The GUI sends `ControlCommand`s and receives `StatusEvent`s. Worker
//! threads report into the same inbound channel, so the control thread sees
//! every input in arrival order.

use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use super::arbiter::SceneRole;
use crate::config::{AppConfig, ConfigPatch};
use crate::detection::{DeathTemplate, MatchResult, RegionOfInterest};
use crate::error::ScoreError;

/// Requests from the user interface.
#[derive(Clone, Debug)]
pub enum ControlCommand {
    Connect,
    Disconnect,
    RefreshScenes,
    StartMonitoring,
    StopMonitoring,
    UpdateConfig(ConfigPatch),
    /// Grab a frame now and store the region as the death template
    CaptureTemplate { roi: RegionOfInterest },
    /// Loads an image file as the template for `roi`
    LoadTemplate { path: PathBuf, roi: RegionOfInterest },
    ClearTemplate,
    Shutdown,
}

/// Everything the control thread consumes.
#[derive(Debug)]
pub enum ControlMessage {
    Command(ControlCommand),
    /// Map key state from the key listener
    KeySample { held: bool, at: Instant },
    /// Key listener could not start, or started
    KeyHook { available: bool, detail: String },
    FrameScored(MatchResult),
    ScoreFailed(ScoreError),
    CaptureFailed(String),
    /// Detection worker ran a pass with no template loaded
    NoTemplate,
    TemplateCaptured(Result<DeathTemplate, String>),
}

impl From<ControlCommand> for ControlMessage {
    fn from(command: ControlCommand) -> Self {
        ControlMessage::Command(command)
    }
}

/// Connection state shown to the user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ObsStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected { version: String },
    Failed(String),
}

impl ObsStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ObsStatus::Connected { .. })
    }
}

impl std::fmt::Display for ObsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObsStatus::Disconnected => write!(f, "Disconnected"),
            ObsStatus::Connecting => write!(f, "Connecting..."),
            ObsStatus::Connected { version } if version.is_empty() => write!(f, "Connected"),
            ObsStatus::Connected { version } => write!(f, "Connected (obs-websocket {})", version),
            ObsStatus::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

/// Death detection state shown to the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetectionStatus {
    #[default]
    Off,
    NoTemplate,
    Scanning,
    Death,
    /// The template or region does not fit the captured frame
    TemplateTooLarge,
    CaptureUnavailable,
}

impl std::fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionStatus::Off => write!(f, "Off"),
            DetectionStatus::NoTemplate => write!(f, "No template"),
            DetectionStatus::Scanning => write!(f, "Scanning"),
            DetectionStatus::Death => write!(f, "Death detected"),
            DetectionStatus::TemplateTooLarge => write!(f, "Template larger than frame"),
            DetectionStatus::CaptureUnavailable => write!(f, "Capture unavailable"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of the GUI log panel.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

/// Updates pushed to the user interface.
#[derive(Clone, Debug)]
pub enum StatusEvent {
    Obs(ObsStatus),
    Scenes { names: Vec<String>, current: Option<String> },
    Monitoring(bool),
    /// Role of the last committed transition. `switched_to` is set only
    /// when OBS accepted the switch.
    Role {
        role: SceneRole,
        switched_to: Option<String>,
    },
    Detection(DetectionStatus),
    /// Latest match score in [0, 1]
    MatchScore(f32),
    KeyHook { available: bool, detail: String },
    Config(Box<AppConfig>),
    Log(LogEntry),
}

/// Both ends of the control plane, created together at startup.
pub struct ControlChannels {
    pub control_tx: Sender<ControlMessage>,
    pub control_rx: Receiver<ControlMessage>,
    pub status_tx: Sender<StatusEvent>,
    pub status_rx: Receiver<StatusEvent>,
}

pub fn create_channels() -> ControlChannels {
    let (control_tx, control_rx) = mpsc::channel();
    let (status_tx, status_rx) = mpsc::channel();
    ControlChannels {
        control_tx,
        control_rx,
        status_tx,
        status_rx,
    }
}

/// Sends status events, tolerating a GUI that has already gone away.
#[derive(Clone, Debug)]
pub struct StatusSender {
    tx: Sender<StatusEvent>,
}

impl StatusSender {
    pub fn new(tx: Sender<StatusEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.log(LogLevel::Error, message);
    }

    fn log(&self, level: LogLevel, message: String) {
        self.send(StatusEvent::Log(LogEntry {
            at: Local::now(),
            level,
            message,
        }));
    }
}
