//! Error types for each boundary of the application.
//!
//! Every variant is recoverable where it occurs. The monitoring loop turns
//! them into status notifications instead of letting them propagate.

use std::time::Instant;

use thiserror::Error;

/// Failure to reach or authenticate with the scene-control service.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Malformed endpoint (bad host or port)
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// TCP connection could not be established
    #[error("could not reach {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection attempt exceeded the configured timeout
    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// WebSocket upgrade or transport failure
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// Server rejected the identify message (usually a wrong password)
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Server requires a password but none is configured
    #[error("server requires a password")]
    PasswordRequired,

    /// Unexpected message during the handshake
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure to switch the active program scene.
#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("not connected to OBS")]
    NotConnected,

    /// The scene name does not exist in OBS
    #[error("scene not found: {0}")]
    UnknownScene(String),

    /// OBS answered with a non-success request status
    #[error("request failed with code {code}: {comment}")]
    Rejected { code: u16, comment: String },

    /// Connection dropped or timed out while waiting for the response
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure to list scenes.
#[derive(Error, Debug)]
pub enum ListError {
    #[error("not connected to OBS")]
    NotConnected,

    #[error("request failed with code {code}: {comment}")]
    Rejected { code: u16, comment: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// Response payload did not have the expected shape
    #[error("malformed scene list: {0}")]
    Malformed(String),
}

/// Failure to score a frame against the template.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    /// Frame smaller than the ROI, or ROI smaller than the template
    #[error(
        "size mismatch: frame {frame_width}x{frame_height}, roi {roi_width}x{roi_height} at ({roi_x}, {roi_y}), template {template_width}x{template_height}"
    )]
    SizeMismatch {
        frame_width: u32,
        frame_height: u32,
        roi_x: u32,
        roi_y: u32,
        roi_width: u32,
        roi_height: u32,
        template_width: u32,
        template_height: u32,
    },
}

/// A debouncer sample arrived with a timestamp earlier than the previous one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("clock went backwards by {:?}", previous.duration_since(*observed))]
pub struct ClockAnomaly {
    pub previous: Instant,
    pub observed: Instant,
}

/// Failure to acquire a frame from the screen.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// No frame source could be acquired on this machine
    #[error("capture unavailable: {0}")]
    Unavailable(String),

    /// The target window could not be found
    #[error("capture target not found: {0}")]
    TargetNotFound(String),

    /// A source was acquired but delivered no frame in time
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("capture failed: {0}")]
    Failed(String),
}

/// The template is being scored and cannot be replaced right now.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("template is in use by a scoring pass")]
pub struct TemplateBusy;

/// Failure to read, validate or persist the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure to start the key-hold listener.
#[derive(Error, Debug)]
pub enum KeySourceError {
    #[error("unknown key name: {0}")]
    UnknownKey(String),

    #[error("key hook unavailable: {0}")]
    Unavailable(String),
}
