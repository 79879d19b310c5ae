//! Persistent configuration.
//!
//! Loads settings from config.json at startup. Holds the OBS endpoint, the
//! scene assigned to each role, the death template and detection/key timing.
//! Every field has a serde default so older or partial files still load.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::detection::{DeathTemplate, DetectionBackend, RegionOfInterest, Template};
use crate::error::ConfigError;
use crate::monitor::SceneRole;

/// OBS websocket endpoint settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObsSettings {
    /// Hostname, or a full `ws://`/`wss://` URL used verbatim
    #[serde(default = "default_host")]
    pub host: String,
    /// Kept wider than u16 so an out-of-range value is reported, not rejected by the parser
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u32 {
    4455
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for ObsSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Scene name per role. An empty name leaves the role unassigned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneNames {
    #[serde(default)]
    pub live: String,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub death: String,
}

impl SceneNames {
    pub fn name_for(&self, role: SceneRole) -> Option<&str> {
        let name = match role {
            SceneRole::Live => &self.live,
            SceneRole::Map => &self.map,
            SceneRole::Death => &self.death,
        };
        if name.is_empty() { None } else { Some(name.as_str()) }
    }
}

/// The death template as stored on disk: grayscale bytes in base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTemplate {
    pub roi: RegionOfInterest,
    pub width: u32,
    pub height: u32,
    pub data: String,
}

impl StoredTemplate {
    pub fn from_death_template(death: &DeathTemplate) -> Self {
        Self {
            roi: death.roi,
            width: death.template.width(),
            height: death.template.height(),
            data: BASE64.encode(death.template.pixels()),
        }
    }

    pub fn to_death_template(&self) -> Result<DeathTemplate, ConfigError> {
        if !self.roi.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "template region must have a positive size, got {}",
                self.roi
            )));
        }
        let bytes = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("template data is not base64: {}", e)))?;
        let len = bytes.len();
        let template = Template::from_gray_bytes(self.width, self.height, bytes).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "template is {}x{} but holds {} bytes",
                self.width, self.height, len
            ))
        })?;
        Ok(DeathTemplate {
            roi: self.roi,
            template,
        })
    }
}

/// What the detection worker captures.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureTarget {
    #[default]
    PrimaryMonitor,
    /// Top-level window owned by a process with this executable name
    Window { process_name: String },
}

impl std::fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureTarget::PrimaryMonitor => write!(f, "primary monitor"),
            CaptureTarget::Window { process_name } => write!(f, "window of {}", process_name),
        }
    }
}

/// Death detection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSettings {
    #[serde(default)]
    pub backend: DetectionBackend,
    /// Match score (0-100) at or above which the death screen counts as present
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: u8,
    /// Time between two captured frames (milliseconds)
    #[serde(default = "default_detect_interval_ms")]
    pub interval_ms: u64,
    /// Minimum time on the death scene once entered (milliseconds)
    #[serde(default = "default_detect_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Continuous non-match required before leaving the death scene (milliseconds)
    #[serde(default = "default_detect_exit_delay_ms")]
    pub exit_delay_ms: u64,
    /// Extra pixels searched around the ROI on each side
    #[serde(default = "default_search_margin_px")]
    pub search_margin_px: u32,
    #[serde(default)]
    pub capture_target: CaptureTarget,
}

fn default_threshold_percent() -> u8 {
    85
}

fn default_detect_interval_ms() -> u64 {
    400
}

fn default_detect_cooldown_ms() -> u64 {
    2000
}

fn default_detect_exit_delay_ms() -> u64 {
    400
}

fn default_search_margin_px() -> u32 {
    8
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            backend: DetectionBackend::default(),
            threshold_percent: default_threshold_percent(),
            interval_ms: default_detect_interval_ms(),
            cooldown_ms: default_detect_cooldown_ms(),
            exit_delay_ms: default_detect_exit_delay_ms(),
            search_margin_px: default_search_margin_px(),
            capture_target: CaptureTarget::default(),
        }
    }
}

/// Map key settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapKeySettings {
    /// Key name, e.g. "G", "Tab", "F5"
    #[serde(default = "default_map_key")]
    pub key: String,
    #[serde(default = "default_key_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay before returning to live after the key is released (milliseconds)
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub exit_delay_ms: u64,
}

fn default_map_key() -> String {
    "G".to_string()
}

fn default_key_poll_interval_ms() -> u64 {
    10
}

fn default_respawn_delay_ms() -> u64 {
    200
}

impl Default for MapKeySettings {
    fn default() -> Self {
        Self {
            key: default_map_key(),
            poll_interval_ms: default_key_poll_interval_ms(),
            respawn_delay_ms: default_respawn_delay_ms(),
            cooldown_ms: 0,
            exit_delay_ms: 0,
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub obs: ObsSettings,
    #[serde(default)]
    pub scenes: SceneNames,
    #[serde(default)]
    pub death_template: Option<StoredTemplate>,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub map_key: MapKeySettings,
    /// Connect to OBS at startup
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Start monitoring once connected, if it was running last time
    #[serde(default = "default_true")]
    pub auto_monitor: bool,
    /// Whether monitoring was running when the config was last written
    #[serde(default)]
    pub monitoring: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            obs: ObsSettings::default(),
            scenes: SceneNames::default(),
            death_template: None,
            detection: DetectionSettings::default(),
            map_key: MapKeySettings::default(),
            auto_connect: true,
            auto_monitor: true,
            monitoring: false,
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.obs.host.trim().is_empty() {
            return Err(ConfigError::Invalid("OBS host is empty".to_string()));
        }
        if !(1..=65535).contains(&self.obs.port) {
            return Err(ConfigError::Invalid(format!(
                "port must be between 1 and 65535, got {}",
                self.obs.port
            )));
        }
        if self.detection.threshold_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "threshold must be between 0 and 100, got {}",
                self.detection.threshold_percent
            )));
        }
        if self.detection.interval_ms == 0 {
            return Err(ConfigError::Invalid("detection interval must be positive".to_string()));
        }
        if self.map_key.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("key poll interval must be positive".to_string()));
        }
        if let Some(stored) = &self.death_template {
            stored.to_death_template()?;
        }
        Ok(())
    }

    /// Resets each invalid value on its own, keeping everything else.
    ///
    /// Returns the repaired config and a description of every reset.
    pub fn repaired(mut self) -> (Self, Vec<String>) {
        let mut resets = Vec::new();
        if self.obs.host.trim().is_empty() {
            resets.push("OBS host was empty".to_string());
            self.obs.host = default_host();
        }
        if !(1..=65535).contains(&self.obs.port) {
            resets.push(format!("port {} was out of range", self.obs.port));
            self.obs.port = default_port();
        }
        if self.detection.threshold_percent > 100 {
            resets.push(format!(
                "threshold {} was above 100",
                self.detection.threshold_percent
            ));
            self.detection.threshold_percent = 100;
        }
        if self.detection.interval_ms == 0 {
            resets.push("detection interval was zero".to_string());
            self.detection.interval_ms = default_detect_interval_ms();
        }
        if self.map_key.poll_interval_ms == 0 {
            resets.push("key poll interval was zero".to_string());
            self.map_key.poll_interval_ms = default_key_poll_interval_ms();
        }
        if let Some(Err(e)) = self.death_template.as_ref().map(|t| t.to_death_template()) {
            resets.push(format!("death template dropped: {}", e));
            self.death_template = None;
        }
        (self, resets)
    }

    /// Returns a copy with every section present in `patch` replaced.
    pub fn merged(&self, patch: ConfigPatch) -> Self {
        let mut next = self.clone();
        if let Some(obs) = patch.obs {
            next.obs = obs;
        }
        if let Some(scenes) = patch.scenes {
            next.scenes = scenes;
        }
        if let Some(death_template) = patch.death_template {
            next.death_template = death_template;
        }
        if let Some(detection) = patch.detection {
            next.detection = detection;
        }
        if let Some(map_key) = patch.map_key {
            next.map_key = map_key;
        }
        if let Some(v) = patch.auto_connect {
            next.auto_connect = v;
        }
        if let Some(v) = patch.auto_monitor {
            next.auto_monitor = v;
        }
        if let Some(v) = patch.monitoring {
            next.monitoring = v;
        }
        if let Some(v) = patch.log_level {
            next.log_level = v;
        }
        next
    }

    /// The stored death template, if present and well-formed.
    pub fn death_template(&self) -> Option<DeathTemplate> {
        let stored = self.death_template.as_ref()?;
        match stored.to_death_template() {
            Ok(template) => Some(template),
            Err(e) => {
                warn!("Ignoring stored death template: {}", e);
                None
            }
        }
    }
}

/// A partial update. `None` leaves a section untouched.
///
/// `death_template: Some(None)` clears the stored template.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigPatch {
    pub obs: Option<ObsSettings>,
    pub scenes: Option<SceneNames>,
    pub death_template: Option<Option<StoredTemplate>>,
    pub detection: Option<DetectionSettings>,
    pub map_key: Option<MapKeySettings>,
    pub auto_connect: Option<bool>,
    pub auto_monitor: Option<bool>,
    pub monitoring: Option<bool>,
    pub log_level: Option<String>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Owns the on-disk config and its in-memory snapshot.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: AppConfig,
    /// The file on disk was not loaded as-is; copy it aside before the first write.
    backup_pending: bool,
}

impl ConfigStore {
    /// Loads the config at `path`, falling back to defaults if it is missing
    /// or unreadable.
    pub fn open(path: PathBuf) -> Self {
        info!("Looking for config at: {}", path.display());
        let (current, backup_pending) = load_config(&path);
        Self {
            path,
            current,
            backup_pending,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &AppConfig {
        &self.current
    }

    /// Merges `patch`, validates the result and writes it to disk.
    ///
    /// On error nothing changes, in memory or on disk.
    pub fn set(&mut self, patch: ConfigPatch) -> Result<&AppConfig, ConfigError> {
        let next = self.current.merged(patch);
        next.validate()?;
        if self.backup_pending {
            let backup = backup_path(&self.path);
            fs::copy(&self.path, &backup)?;
            warn!("Previous config kept at {}", backup.display());
            self.backup_pending = false;
        }
        write_atomic(&self.path, &next)?;
        self.current = next;
        Ok(&self.current)
    }
}

/// Sibling file that keeps a config we could not use as-is.
pub fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.bak")
}

/// Returns the config and whether the file on disk must be backed up
/// before it is overwritten.
fn load_config(path: &Path) -> (AppConfig, bool) {
    if !path.exists() {
        info!("config.json not found. Using default config.");
        return (AppConfig::default(), false);
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Failed to read config.json: {}. Using defaults.", e);
            return (AppConfig::default(), true);
        }
    };
    let config: AppConfig = match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to parse config.json: {}. Using defaults.", e);
            return (AppConfig::default(), true);
        }
    };
    let (config, resets) = config.repaired();
    for reset in &resets {
        warn!("config.json: {}, using the default", reset);
    }
    info!("Config loaded from {}", path.display());
    (config, !resets.is_empty())
}

/// Writes to a sibling temp file, syncs it, then renames over the target.
fn write_atomic(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
