//! GUI application state management.
//!
//! Holds the last status reported by the control thread and the editable
//! copies of the settings. Edits only reach the control thread through a
//! validated `ConfigPatch`.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, CaptureTarget, ConfigPatch, ObsSettings, SceneNames};
use crate::detection::{DetectionBackend, RegionOfInterest};
use crate::input::parse_key_name;
use crate::monitor::{DetectionStatus, LogEntry, ObsStatus, SceneRole, StatusEvent};

/// Lines kept in the log panel.
pub const LOG_CAPACITY: usize = 500;

/// Something the user asked for in this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiAction {
    Connect,
    Disconnect,
    RefreshScenes,
    SaveConnection,
    SaveScenes,
    StartMonitoring,
    StopMonitoring,
    SaveDetection,
    CaptureTemplate,
    LoadTemplate,
    ClearTemplate,
    SaveLog,
    ClearLog,
}

/// Editable copies of the settings shown in the form.
#[derive(Clone, Debug, Default)]
pub struct SettingsDraft {
    pub host: String,
    /// Kept as text so a bad value can be reported instead of clamped
    pub port: String,
    pub password: String,
    pub scenes: SceneNames,
    pub backend: DetectionBackend,
    pub threshold_percent: u8,
    pub interval_ms: u64,
    pub capture_window: bool,
    pub process_name: String,
    pub map_key: String,
    pub respawn_delay_ms: u64,
    pub roi_x: u32,
    pub roi_y: u32,
    pub roi_width: u32,
    pub roi_height: u32,
    /// Image file to load as the death template
    pub template_path: String,
    pub auto_connect: bool,
    pub auto_monitor: bool,
}

impl SettingsDraft {
    pub fn from_config(config: &AppConfig) -> Self {
        let (capture_window, process_name) = match &config.detection.capture_target {
            CaptureTarget::PrimaryMonitor => (false, String::new()),
            CaptureTarget::Window { process_name } => (true, process_name.clone()),
        };
        let roi = config
            .death_template
            .as_ref()
            .map(|t| t.roi)
            .unwrap_or(RegionOfInterest {
                x: 0,
                y: 0,
                width: 200,
                height: 80,
            });
        Self {
            host: config.obs.host.clone(),
            port: config.obs.port.to_string(),
            password: config.obs.password.clone(),
            scenes: config.scenes.clone(),
            backend: config.detection.backend,
            threshold_percent: config.detection.threshold_percent,
            interval_ms: config.detection.interval_ms,
            capture_window,
            process_name,
            map_key: config.map_key.key.clone(),
            respawn_delay_ms: config.map_key.respawn_delay_ms,
            roi_x: roi.x,
            roi_y: roi.y,
            roi_width: roi.width,
            roi_height: roi.height,
            template_path: String::new(),
            auto_connect: config.auto_connect,
            auto_monitor: config.auto_monitor,
        }
    }

    /// Resets only the sections that differ between `old` and `new`, so
    /// unsaved edits elsewhere in the form survive.
    pub fn refresh(&mut self, old: &AppConfig, new: &AppConfig) {
        let fresh = Self::from_config(new);
        if old.obs != new.obs
            || old.auto_connect != new.auto_connect
            || old.auto_monitor != new.auto_monitor
        {
            self.host = fresh.host;
            self.port = fresh.port;
            self.password = fresh.password;
            self.auto_connect = fresh.auto_connect;
            self.auto_monitor = fresh.auto_monitor;
        }
        if old.scenes != new.scenes {
            self.scenes = fresh.scenes;
        }
        if old.detection != new.detection || old.map_key != new.map_key {
            self.backend = fresh.backend;
            self.threshold_percent = fresh.threshold_percent;
            self.interval_ms = fresh.interval_ms;
            self.capture_window = fresh.capture_window;
            self.process_name = fresh.process_name;
            self.map_key = fresh.map_key;
            self.respawn_delay_ms = fresh.respawn_delay_ms;
        }
        let stored_roi = |c: &AppConfig| c.death_template.as_ref().map(|t| t.roi);
        if let Some(roi) = stored_roi(new).filter(|roi| stored_roi(old) != Some(*roi)) {
            self.roi_x = roi.x;
            self.roi_y = roi.y;
            self.roi_width = roi.width;
            self.roi_height = roi.height;
        }
    }

    /// Connection section plus the startup toggles.
    pub fn connection_patch(&self, current: &AppConfig) -> Result<ConfigPatch, String> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err("Host must not be empty".to_string());
        }
        let port = self
            .port
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|p| (1..=65535).contains(p))
            .ok_or_else(|| format!("Port must be a number between 1 and 65535, got \"{}\"", self.port.trim()))?;
        Ok(ConfigPatch {
            obs: Some(ObsSettings {
                host: host.to_string(),
                port,
                password: self.password.clone(),
                ..current.obs.clone()
            }),
            auto_connect: Some(self.auto_connect),
            auto_monitor: Some(self.auto_monitor),
            ..Default::default()
        })
    }

    pub fn scenes_patch(&self) -> ConfigPatch {
        ConfigPatch {
            scenes: Some(self.scenes.clone()),
            ..Default::default()
        }
    }

    /// Detection and map key sections.
    pub fn detection_patch(&self, current: &AppConfig) -> Result<ConfigPatch, String> {
        if self.threshold_percent > 100 {
            return Err("Threshold must be between 0 and 100".to_string());
        }
        if self.interval_ms == 0 {
            return Err("Capture interval must be at least 1 ms".to_string());
        }
        let capture_target = if self.capture_window {
            let process_name = self.process_name.trim();
            if process_name.is_empty() {
                return Err("Enter the game's executable name, e.g. game.exe".to_string());
            }
            CaptureTarget::Window {
                process_name: process_name.to_string(),
            }
        } else {
            CaptureTarget::PrimaryMonitor
        };
        parse_key_name(&self.map_key).map_err(|e| e.to_string())?;

        let mut detection = current.detection.clone();
        detection.backend = self.backend;
        detection.threshold_percent = self.threshold_percent;
        detection.interval_ms = self.interval_ms;
        detection.capture_target = capture_target;

        let mut map_key = current.map_key.clone();
        map_key.key = self.map_key.trim().to_string();
        map_key.respawn_delay_ms = self.respawn_delay_ms;

        Ok(ConfigPatch {
            detection: Some(detection),
            map_key: Some(map_key),
            ..Default::default()
        })
    }

    pub fn template_roi(&self) -> Result<RegionOfInterest, String> {
        RegionOfInterest::new(self.roi_x, self.roi_y, self.roi_width, self.roi_height)
            .ok_or_else(|| "Template region must have a positive width and height".to_string())
    }

    pub fn template_file(&self) -> Result<PathBuf, String> {
        let path = self.template_path.trim();
        if path.is_empty() {
            return Err("Choose an image file to load".to_string());
        }
        Ok(PathBuf::from(path))
    }
}

/// Renders log entries as plain text, one line each.
pub fn format_log<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> String {
    let mut text = String::new();
    for entry in entries {
        let _ = writeln!(
            text,
            "{} [{}] {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            entry.level,
            entry.message
        );
    }
    text
}

/// Writes the log panel contents to `path`.
pub fn save_log(path: &Path, entries: &VecDeque<LogEntry>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format_log(entries))
}

/// GUI application state.
#[derive(Debug, Default)]
pub struct GuiState {
    pub config: AppConfig,
    pub draft: SettingsDraft,
    pub obs: ObsStatus,
    /// Scene names as OBS returned them
    pub scenes: Vec<String>,
    pub current_scene: Option<String>,
    pub monitoring: bool,
    pub role: Option<SceneRole>,
    pub detection: DetectionStatus,
    pub match_score: Option<f32>,
    /// (available, detail) once the key listener has reported
    pub key_hook: Option<(bool, String)>,
    pub log: VecDeque<LogEntry>,
    /// Last rejected input, shown next to the form
    pub validation: Option<String>,
    /// Set once the first config has filled the draft
    config_loaded: bool,
}

impl GuiState {
    /// Folds one status event into the displayed state.
    pub fn apply(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Obs(status) => {
                if !status.is_connected() {
                    self.current_scene = None;
                }
                self.obs = status;
            }
            StatusEvent::Scenes { names, current } => {
                self.scenes = names;
                self.current_scene = current;
            }
            StatusEvent::Monitoring(running) => {
                self.monitoring = running;
                if !running {
                    self.match_score = None;
                    self.role = None;
                }
            }
            StatusEvent::Role { role, switched_to } => {
                self.role = Some(role);
                if switched_to.is_some() {
                    self.current_scene = switched_to;
                }
            }
            StatusEvent::Detection(status) => self.detection = status,
            StatusEvent::MatchScore(score) => self.match_score = Some(score),
            StatusEvent::KeyHook { available, detail } => self.key_hook = Some((available, detail)),
            StatusEvent::Config(config) => {
                if self.config_loaded {
                    self.draft.refresh(&self.config, &config);
                } else {
                    self.draft = SettingsDraft::from_config(&config);
                    self.config_loaded = true;
                }
                self.config = *config;
            }
            StatusEvent::Log(entry) => {
                if self.log.len() >= LOG_CAPACITY {
                    self.log.pop_front();
                }
                self.log.push_back(entry);
            }
        }
    }

    pub fn has_template(&self) -> bool {
        self.config.death_template.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::LogLevel;
    use chrono::Local;

    fn log_entry(n: usize) -> LogEntry {
        LogEntry {
            at: Local::now(),
            level: LogLevel::Info,
            message: format!("line {}", n),
        }
    }

    #[test]
    fn test_log_is_bounded() {
        let mut state = GuiState::default();
        for n in 0..LOG_CAPACITY + 10 {
            state.apply(StatusEvent::Log(log_entry(n)));
        }
        assert_eq!(state.log.len(), LOG_CAPACITY);
        assert_eq!(state.log.front().map(|e| e.message.as_str()), Some("line 10"));
    }

    #[test]
    fn test_first_config_event_fills_draft() {
        let mut state = GuiState::default();
        let mut config = AppConfig::default();
        config.obs.port = 4460;
        state.apply(StatusEvent::Config(Box::new(config)));
        assert_eq!(state.draft.host, "127.0.0.1");
        assert_eq!(state.draft.port, "4460");
    }

    #[test]
    fn test_config_event_keeps_unrelated_edits() {
        let mut state = GuiState::default();
        let config = AppConfig::default();
        state.apply(StatusEvent::Config(Box::new(config.clone())));
        state.draft.host = "typed".to_string();
        state.draft.scenes.map = "typed-map".to_string();

        // Monitoring flag persisted: nothing in the form changed
        let mut next = config.clone();
        next.monitoring = true;
        state.apply(StatusEvent::Config(Box::new(next.clone())));
        assert_eq!(state.draft.host, "typed");
        assert_eq!(state.draft.scenes.map, "typed-map");

        // A template install moves the region fields only
        next.death_template = Some(crate::config::StoredTemplate {
            roi: RegionOfInterest::new(5, 6, 7, 8).unwrap(),
            width: 1,
            height: 1,
            data: "AA==".to_string(),
        });
        state.apply(StatusEvent::Config(Box::new(next.clone())));
        assert_eq!((state.draft.roi_x, state.draft.roi_width), (5, 7));
        assert_eq!(state.draft.host, "typed");

        // Saved connection settings replace the connection fields
        next.obs.port = 4460;
        state.apply(StatusEvent::Config(Box::new(next)));
        assert_eq!(state.draft.host, "127.0.0.1");
        assert_eq!(state.draft.port, "4460");
        assert_eq!(state.draft.scenes.map, "typed-map");
    }

    #[test]
    fn test_port_validation() {
        let config = AppConfig::default();
        let mut draft = SettingsDraft::from_config(&config);
        draft.port = "70000".to_string();
        assert!(draft.connection_patch(&config).is_err());
        draft.port = "abc".to_string();
        assert!(draft.connection_patch(&config).is_err());
        draft.port = " 4456 ".to_string();
        let patch = draft.connection_patch(&config).unwrap();
        assert_eq!(patch.obs.map(|o| o.port), Some(4456));
    }

    #[test]
    fn test_detection_validation() {
        let config = AppConfig::default();
        let mut draft = SettingsDraft::from_config(&config);
        draft.capture_window = true;
        assert!(draft.detection_patch(&config).is_err());
        draft.process_name = "game.exe".to_string();
        draft.map_key = "NotAKey".to_string();
        assert!(draft.detection_patch(&config).is_err());
        draft.map_key = "Tab".to_string();
        let patch = draft.detection_patch(&config).unwrap();
        assert_eq!(
            patch.detection.map(|d| d.capture_target),
            Some(CaptureTarget::Window {
                process_name: "game.exe".to_string()
            })
        );
    }

    #[test]
    fn test_template_roi_rejects_empty() {
        let mut draft = SettingsDraft::from_config(&AppConfig::default());
        draft.roi_width = 0;
        assert!(draft.template_roi().is_err());
        draft.roi_width = 10;
        assert!(draft.template_roi().is_ok());
    }

    #[test]
    fn test_role_updates_current_scene_only_on_switch() {
        let mut state = GuiState::default();
        state.apply(StatusEvent::Scenes {
            names: vec!["Game".to_string(), "Map".to_string()],
            current: Some("Game".to_string()),
        });
        state.apply(StatusEvent::Role {
            role: SceneRole::Map,
            switched_to: None,
        });
        assert_eq!(state.role, Some(SceneRole::Map));
        assert_eq!(state.current_scene.as_deref(), Some("Game"));

        state.apply(StatusEvent::Role {
            role: SceneRole::Map,
            switched_to: Some("Map".to_string()),
        });
        assert_eq!(state.current_scene.as_deref(), Some("Map"));
        state.apply(StatusEvent::Monitoring(false));
        assert_eq!(state.role, None);
    }

    #[test]
    fn test_template_file_requires_path() {
        let mut draft = SettingsDraft::from_config(&AppConfig::default());
        assert!(draft.template_file().is_err());
        draft.template_path = " death.png ".to_string();
        assert_eq!(draft.template_file(), Ok(PathBuf::from("death.png")));
    }

    #[test]
    fn test_save_log_writes_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.txt");
        let mut log = VecDeque::new();
        log.push_back(log_entry(1));
        log.push_back(LogEntry {
            level: LogLevel::Error,
            ..log_entry(2)
        });
        save_log(&path, &log).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] line 1"), "{}", lines[0]);
        assert!(lines[1].ends_with("[ERROR] line 2"), "{}", lines[1]);
    }
}
