//! Control thread: owns the OBS connection, the config store and the
//! monitoring session.
//!
//! Every input arrives on one channel and is processed to completion before
//! the next. While nothing arrives, the thread sleeps until the session's
//! next deadline (a delayed return to live, or a held-back edge).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::arbiter::{ArbiterNotice, SceneRole, SceneSink};
use super::events::{
    ControlCommand, ControlMessage, DetectionStatus, ObsStatus, StatusEvent, StatusSender,
};
use super::session::MonitoringSession;
use super::worker::{load_template, spawn_detection_worker, spawn_template_capture};
use crate::config::{ConfigPatch, ConfigStore, StoredTemplate};
use crate::detection::{DeathTemplate, RegionOfInterest, TemplateSlot};
use crate::error::{ClockAnomaly, SwitchError};
use crate::input::spawn_key_listener;
use crate::obs::ObsClient;

/// Delay before retrying a template swap that collided with a scoring pass.
const TEMPLATE_RETRY: Duration = Duration::from_millis(25);

/// Stands in for OBS while disconnected.
struct Offline;

impl SceneSink for Offline {
    fn switch_to(&mut self, _scene: &str) -> Result<(), SwitchError> {
        Err(SwitchError::NotConnected)
    }
}

/// Worker threads and session of a running monitor.
struct ActiveMonitoring {
    session: MonitoringSession,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ActiveMonitoring {
    fn stop_workers(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("Worker thread panicked: {:?}", e);
            }
        }
    }
}

/// A template waiting to be swapped in once the scoring pass releases it.
struct PendingTemplate {
    template: Option<DeathTemplate>,
    retry_at: Instant,
}

pub struct Controller {
    store: ConfigStore,
    status: StatusSender,
    /// Handed to worker threads so they report into the control channel
    control_tx: Sender<ControlMessage>,
    obs: Option<ObsClient>,
    slot: Arc<TemplateSlot>,
    monitoring: Option<ActiveMonitoring>,
    detection: DetectionStatus,
    pending_template: Option<PendingTemplate>,
}

/// Spawns the control thread.
pub fn spawn_control(
    store: ConfigStore,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    status_tx: Sender<StatusEvent>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let controller = Controller::new(store, control_tx, StatusSender::new(status_tx));
            controller.run(control_rx);
        })
}

impl Controller {
    pub fn new(store: ConfigStore, control_tx: Sender<ControlMessage>, status: StatusSender) -> Self {
        let template = store.get().death_template();
        if let Some(death) = &template {
            info!("Restored death template {}", death.roi);
        }
        Self {
            store,
            status,
            control_tx,
            obs: None,
            slot: Arc::new(TemplateSlot::new(template)),
            monitoring: None,
            detection: DetectionStatus::Off,
            pending_template: None,
        }
    }

    /// Processes messages until `Shutdown` or until every sender is gone.
    pub fn run(mut self, rx: Receiver<ControlMessage>) {
        self.startup();
        loop {
            let received = match self.next_deadline() {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(msg) => {
                    if !self.handle(msg) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.tick(Instant::now());
        }
        self.shutdown();
    }

    fn startup(&mut self) {
        let config = self.store.get().clone();
        self.status.info(format!("Config path: {}", self.store.path().display()));
        self.status.send(StatusEvent::Config(Box::new(config.clone())));
        self.status.send(StatusEvent::Obs(ObsStatus::Disconnected));
        self.status.send(StatusEvent::Monitoring(false));
        self.status.send(StatusEvent::Detection(DetectionStatus::Off));
        if config.auto_connect {
            self.connect();
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut active) = self.monitoring.take() {
            active.stop_workers();
        }
        if let Some(client) = self.obs.take() {
            client.disconnect();
        }
        info!("Control thread finished");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let session = self
            .monitoring
            .as_ref()
            .and_then(|active| active.session.next_deadline());
        let retry = self.pending_template.as_ref().map(|p| p.retry_at);
        session.into_iter().chain(retry).min()
    }

    /// Handles one message. Returns false when the thread should exit.
    pub fn handle(&mut self, msg: ControlMessage) -> bool {
        match msg {
            ControlMessage::Command(command) => return self.handle_command(command),
            ControlMessage::KeySample { held, at } => {
                let result = self.with_session(|session, sink| session.on_key_sample(held, at, sink));
                self.report(result);
            }
            ControlMessage::KeyHook { available, detail } => {
                if available {
                    self.status.info(format!("Key hook: {}", detail));
                } else {
                    self.status.warn(format!("Key hook not available: {}", detail));
                }
                self.status.send(StatusEvent::KeyHook { available, detail });
            }
            ControlMessage::FrameScored(result) => {
                if self.monitoring.is_none() {
                    return true;
                }
                self.status.send(StatusEvent::MatchScore(result.score));
                let outcome = self.with_session(|session, sink| session.on_match(result, sink));
                self.report(outcome);
                let dead = self
                    .monitoring
                    .as_ref()
                    .is_some_and(|active| active.session.death_active());
                self.set_detection(if dead {
                    DetectionStatus::Death
                } else {
                    DetectionStatus::Scanning
                });
            }
            ControlMessage::ScoreFailed(e) => {
                if self.monitoring.is_some() && self.detection != DetectionStatus::TemplateTooLarge {
                    self.status.warn(format!("Frame skipped: {}", e));
                }
                self.set_detection(DetectionStatus::TemplateTooLarge);
            }
            ControlMessage::CaptureFailed(msg) => {
                if self.monitoring.is_some() && self.detection != DetectionStatus::CaptureUnavailable {
                    self.status.warn(format!("Capture unavailable: {}", msg));
                }
                self.set_detection(DetectionStatus::CaptureUnavailable);
            }
            ControlMessage::NoTemplate => {
                if self.monitoring.is_some() && self.detection != DetectionStatus::NoTemplate {
                    self.status.warn("No death template captured; death detection is idle");
                }
                self.set_detection(DetectionStatus::NoTemplate);
            }
            ControlMessage::TemplateCaptured(Ok(template)) => {
                self.install_template(Some(template), Instant::now());
            }
            ControlMessage::TemplateCaptured(Err(msg)) => {
                self.status.error(format!("Template capture failed: {}", msg));
            }
        }
        true
    }

    fn handle_command(&mut self, command: ControlCommand) -> bool {
        // Patches may carry the OBS password
        if !matches!(command, ControlCommand::UpdateConfig(_)) {
            debug!("Command: {:?}", command);
        }
        match command {
            ControlCommand::Connect => self.connect(),
            ControlCommand::Disconnect => self.disconnect(),
            ControlCommand::RefreshScenes => self.refresh_scenes(),
            ControlCommand::StartMonitoring => self.start_monitoring(),
            ControlCommand::StopMonitoring => self.stop_monitoring(),
            ControlCommand::UpdateConfig(patch) => self.update_config(patch),
            ControlCommand::CaptureTemplate { roi } => self.capture_template(roi),
            ControlCommand::LoadTemplate { path, roi } => self.load_template(&path, roi),
            ControlCommand::ClearTemplate => self.install_template(None, Instant::now()),
            ControlCommand::Shutdown => return false,
        }
        true
    }

    /// Delivers deadlines that passed while waiting.
    pub fn tick(&mut self, now: Instant) {
        if self.monitoring.is_some() {
            let result = self.with_session(|session, sink| Ok(session.tick(now, sink)));
            self.report(result);
        }
        if let Some(pending) = self.pending_template.take() {
            if now >= pending.retry_at {
                self.install_template(pending.template, now);
            } else {
                self.pending_template = Some(pending);
            }
        }
    }

    /// Runs `f` against the active session with OBS (or the offline stand-in)
    /// as the sink. Does nothing when not monitoring.
    fn with_session<F>(&mut self, f: F) -> Result<Vec<ArbiterNotice>, ClockAnomaly>
    where
        F: FnOnce(&mut MonitoringSession, &mut dyn SceneSink) -> Result<Vec<ArbiterNotice>, ClockAnomaly>,
    {
        let Some(active) = self.monitoring.as_mut() else {
            return Ok(Vec::new());
        };
        let mut offline = Offline;
        let sink: &mut dyn SceneSink = match self.obs.as_mut() {
            Some(client) => client,
            None => &mut offline,
        };
        let result = f(&mut active.session, sink);
        self.check_connection();
        result
    }

    fn report(&mut self, result: Result<Vec<ArbiterNotice>, ClockAnomaly>) {
        let notices = match result {
            Ok(notices) => notices,
            Err(anomaly) => {
                self.status.warn(format!("Sample ignored: {}", anomaly));
                return;
            }
        };
        for notice in notices {
            match &notice {
                ArbiterNotice::Switched { role, scene } => {
                    self.status.info(notice.to_string());
                    self.status.send(StatusEvent::Role {
                        role: *role,
                        switched_to: Some(scene.clone()),
                    });
                }
                ArbiterNotice::SwitchFailed { role, .. } | ArbiterNotice::Unassigned { role } => {
                    self.status.warn(notice.to_string());
                    self.status.send(StatusEvent::Role {
                        role: *role,
                        switched_to: None,
                    });
                }
                ArbiterNotice::Scheduled { .. }
                | ArbiterNotice::Cancelled { .. }
                | ArbiterNotice::Ignored { .. } => debug!("{}", notice),
            }
        }
    }

    fn set_detection(&mut self, status: DetectionStatus) {
        // Late worker messages must not override Off after a stop
        let status = if self.monitoring.is_none() {
            DetectionStatus::Off
        } else {
            status
        };
        if self.detection != status {
            self.detection = status;
            self.status.send(StatusEvent::Detection(status));
        }
    }

    fn connect(&mut self) {
        if self.obs.as_ref().is_some_and(|client| client.is_connected()) {
            self.status.info("Already connected to OBS");
            return;
        }
        self.status.send(StatusEvent::Obs(ObsStatus::Connecting));
        let settings = self.store.get().obs.clone();
        match ObsClient::connect(&settings) {
            Ok(client) => {
                let version = client.server_version().to_string();
                self.status.info(format!("Connected to OBS at {}", client.url()));
                self.obs = Some(client);
                self.status.send(StatusEvent::Obs(ObsStatus::Connected { version }));
                self.refresh_scenes();
                if self.store.get().auto_monitor && self.monitoring.is_none() {
                    self.start_monitoring();
                }
            }
            Err(e) => {
                self.obs = None;
                self.status.error(format!("OBS connect failed: {}", e));
                self.status.send(StatusEvent::Obs(ObsStatus::Failed(e.to_string())));
            }
        }
    }

    fn disconnect(&mut self) {
        match self.obs.take() {
            Some(client) => {
                client.disconnect();
                self.status.info("Disconnected from OBS");
            }
            None => debug!("Disconnect requested while not connected"),
        }
        self.status.send(StatusEvent::Obs(ObsStatus::Disconnected));
    }

    /// Drops a client whose transport has failed.
    fn check_connection(&mut self) {
        if self.obs.as_ref().is_some_and(|client| !client.is_connected()) {
            self.obs = None;
            self.status.error("Lost connection to OBS");
            self.status.send(StatusEvent::Obs(ObsStatus::Failed(
                "connection lost".to_string(),
            )));
        }
    }

    fn refresh_scenes(&mut self) {
        let Some(client) = self.obs.as_mut() else {
            self.status.warn("Cannot refresh scenes: not connected to OBS");
            return;
        };
        let result = client.list_scenes();
        self.check_connection();
        match result {
            Ok(list) => {
                self.status.info(format!("Loaded {} scenes", list.scenes.len()));
                self.status.send(StatusEvent::Scenes {
                    names: list.scenes,
                    current: list.current,
                });
            }
            Err(e) => self.status.error(format!("Scene list failed: {}", e)),
        }
    }

    fn start_monitoring(&mut self) {
        if self.monitoring.is_some() {
            return;
        }
        let config = self.store.get().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let mut active = ActiveMonitoring {
            session: MonitoringSession::new(&config),
            stop: stop.clone(),
            workers: Vec::new(),
        };

        let spawned = spawn_key_listener(
            config.map_key.key.clone(),
            Duration::from_millis(config.map_key.poll_interval_ms.max(1)),
            self.control_tx.clone(),
            stop.clone(),
        )
        .and_then(|key| {
            active.workers.push(key);
            spawn_detection_worker(
                config.detection.clone(),
                self.slot.clone(),
                self.control_tx.clone(),
                stop,
            )
        });
        match spawned {
            Ok(detection) => active.workers.push(detection),
            Err(e) => {
                active.stop_workers();
                self.status.error(format!("Could not start monitoring: {}", e));
                return;
            }
        }

        self.monitoring = Some(active);
        self.detection = DetectionStatus::Off;
        self.set_detection(DetectionStatus::Scanning);
        self.status.send(StatusEvent::Monitoring(true));
        self.status.send(StatusEvent::Role {
            role: SceneRole::Live,
            switched_to: None,
        });
        self.status.info("Monitoring started");
        self.persist_monitoring(true);
    }

    fn stop_monitoring(&mut self) {
        let Some(mut active) = self.monitoring.take() else {
            return;
        };
        active.stop_workers();
        self.set_detection(DetectionStatus::Off);
        self.status.send(StatusEvent::Monitoring(false));
        self.status.info("Monitoring stopped");
        self.persist_monitoring(false);
    }

    fn persist_monitoring(&mut self, monitoring: bool) {
        let patch = ConfigPatch {
            monitoring: Some(monitoring),
            ..Default::default()
        };
        if let Err(e) = self.store.set(patch) {
            self.status.warn(format!("Could not save monitoring state: {}", e));
        }
    }

    fn update_config(&mut self, patch: ConfigPatch) {
        if patch.is_empty() {
            return;
        }
        let restart_workers = patch.detection.is_some() || patch.map_key.is_some();
        match self.store.set(patch) {
            Ok(config) => {
                let config = config.clone();
                self.status.info("Settings saved");
                if let Some(active) = self.monitoring.as_mut() {
                    active.session.apply_config(&config);
                }
                self.status.send(StatusEvent::Config(Box::new(config)));
                if restart_workers && self.monitoring.is_some() {
                    self.restart_workers();
                }
            }
            Err(e) => {
                self.status.warn(format!("Settings not saved: {}", e));
                // Put the GUI back on the stored values
                self.status.send(StatusEvent::Config(Box::new(self.store.get().clone())));
            }
        }
    }

    /// Restarts key and detection workers with the current config, keeping
    /// the session and its scene state.
    fn restart_workers(&mut self) {
        let Some(mut active) = self.monitoring.take() else {
            return;
        };
        active.stop_workers();
        let config = self.store.get().clone();
        let stop = Arc::new(AtomicBool::new(false));
        active.stop = stop.clone();

        let spawned = spawn_key_listener(
            config.map_key.key.clone(),
            Duration::from_millis(config.map_key.poll_interval_ms.max(1)),
            self.control_tx.clone(),
            stop.clone(),
        )
        .and_then(|key| {
            active.workers.push(key);
            spawn_detection_worker(config.detection, self.slot.clone(), self.control_tx.clone(), stop)
        });
        match spawned {
            Ok(detection) => {
                active.workers.push(detection);
                self.monitoring = Some(active);
                debug!("Workers restarted with new settings");
            }
            Err(e) => {
                active.stop_workers();
                self.status.error(format!("Could not restart monitoring: {}", e));
                self.set_detection(DetectionStatus::Off);
                self.status.send(StatusEvent::Monitoring(false));
                self.persist_monitoring(false);
            }
        }
    }

    fn capture_template(&mut self, roi: RegionOfInterest) {
        if !roi.is_valid() {
            self.status.warn("Template region must have a positive width and height");
            return;
        }
        let target = self.store.get().detection.capture_target.clone();
        self.status.info(format!("Capturing template {} from {}", roi, target));
        if let Err(e) = spawn_template_capture(target, roi, self.control_tx.clone()) {
            self.status.error(format!("Template capture failed: {}", e));
        }
    }

    /// Swaps the active template and persists it. A swap that collides with
    /// a scoring pass is retried shortly after.
    fn load_template(&mut self, path: &Path, roi: RegionOfInterest) {
        match load_template(path, roi) {
            Ok(template) => {
                self.status.info(format!("Template loaded from {}", path.display()));
                self.install_template(Some(template), Instant::now());
            }
            Err(e) => self.status.error(format!("Template load failed: {}", e)),
        }
    }

    fn install_template(&mut self, template: Option<DeathTemplate>, now: Instant) {
        if self.slot.replace(template.clone()).is_err() {
            debug!("Template busy, retrying");
            self.pending_template = Some(PendingTemplate {
                template,
                retry_at: now + TEMPLATE_RETRY,
            });
            return;
        }

        match &template {
            Some(death) => self.status.info(format!(
                "Death template set: {}x{} at {}",
                death.template.width(),
                death.template.height(),
                death.roi
            )),
            None => self.status.info("Death template cleared"),
        }

        let patch = ConfigPatch {
            death_template: Some(template.as_ref().map(StoredTemplate::from_death_template)),
            ..Default::default()
        };
        match self.store.set(patch) {
            Ok(config) => {
                let config = config.clone();
                self.status.send(StatusEvent::Config(Box::new(config)));
            }
            Err(e) => self.status.error(format!("Could not save template: {}", e)),
        }
        if self.monitoring.is_some() {
            self.set_detection(if template.is_some() {
                DetectionStatus::Scanning
            } else {
                DetectionStatus::NoTemplate
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{MatchResult, Template};
    use crate::monitor::events::create_channels;

    fn controller(dir: &tempfile::TempDir) -> (Controller, Receiver<StatusEvent>) {
        let store = ConfigStore::open(dir.path().join("config.json"));
        let channels = create_channels();
        let controller = Controller::new(
            store,
            channels.control_tx.clone(),
            StatusSender::new(channels.status_tx.clone()),
        );
        (controller, channels.status_rx)
    }

    fn death_template() -> DeathTemplate {
        DeathTemplate {
            roi: RegionOfInterest::new(5, 5, 2, 2).unwrap(),
            template: Template::from_gray_bytes(2, 2, vec![9, 8, 7, 6]).unwrap(),
        }
    }

    fn active_session(controller: &mut Controller) {
        let mut config = controller.store.get().clone();
        config.scenes.map = "Map".to_string();
        controller.monitoring = Some(ActiveMonitoring {
            session: MonitoringSession::new(&config),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        });
    }

    #[test]
    fn test_template_install_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, status_rx) = controller(&dir);
        controller.handle(ControlMessage::TemplateCaptured(Ok(death_template())));

        assert_eq!(controller.slot.is_loaded(), Ok(true));
        let reopened = ConfigStore::open(dir.path().join("config.json"));
        assert_eq!(reopened.get().death_template(), Some(death_template()));
        assert!(
            status_rx
                .try_iter()
                .any(|e| matches!(e, StatusEvent::Config(c) if c.death_template.is_some()))
        );
    }

    #[test]
    fn test_busy_template_install_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _status_rx) = controller(&dir);
        let slot = controller.slot.clone();
        let t = Instant::now();

        let guard = slot.begin_scoring().unwrap();
        controller.install_template(Some(death_template()), t);
        assert!(controller.pending_template.is_some());
        assert_eq!(controller.next_deadline(), Some(t + TEMPLATE_RETRY));
        drop(guard);

        controller.tick(t + TEMPLATE_RETRY);
        assert!(controller.pending_template.is_none());
        assert_eq!(slot.is_loaded(), Ok(true));
    }

    #[test]
    fn test_load_template_command_installs_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, status_rx) = controller(&dir);
        let path = dir.path().join("death.png");
        image::GrayImage::from_fn(3, 2, |x, y| image::Luma([(x * 10 + y) as u8]))
            .save(&path)
            .unwrap();
        let roi = RegionOfInterest::new(40, 30, 8, 8).unwrap();

        controller.handle(ControlMessage::Command(ControlCommand::LoadTemplate {
            path: path.clone(),
            roi,
        }));
        assert_eq!(controller.slot.is_loaded(), Ok(true));
        let stored = controller.store.get().death_template().unwrap();
        assert_eq!(stored.roi, roi);
        assert_eq!(stored.template.pixels(), &[0, 10, 20, 1, 11, 21]);

        controller.handle(ControlMessage::Command(ControlCommand::LoadTemplate {
            path: dir.path().join("missing.png"),
            roi,
        }));
        assert_eq!(controller.store.get().death_template(), Some(stored));
        assert!(status_rx.try_iter().any(|e| matches!(
            e,
            StatusEvent::Log(entry) if entry.message.starts_with("Template load failed")
        )));
    }

    #[test]
    fn test_clear_template() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _status_rx) = controller(&dir);
        controller.install_template(Some(death_template()), Instant::now());
        controller.handle(ControlMessage::Command(ControlCommand::ClearTemplate));
        assert_eq!(controller.slot.is_loaded(), Ok(false));
        assert!(controller.store.get().death_template.is_none());
    }

    #[test]
    fn test_key_sample_while_offline_reports_switch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, status_rx) = controller(&dir);
        active_session(&mut controller);

        controller.handle(ControlMessage::KeySample {
            held: true,
            at: Instant::now(),
        });
        let events: Vec<StatusEvent> = status_rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            StatusEvent::Role {
                role: SceneRole::Map,
                switched_to: None
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            StatusEvent::Log(entry) if entry.message.contains("not connected")
        )));
        assert_eq!(
            controller
                .monitoring
                .as_ref()
                .map(|a| a.session.arbiter_state().current_role),
            Some(SceneRole::Map)
        );
    }

    #[test]
    fn test_frame_scores_drive_detection_status() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, status_rx) = controller(&dir);
        active_session(&mut controller);
        let t = Instant::now();

        controller.handle(ControlMessage::FrameScored(MatchResult { score: 0.2, at: t }));
        assert_eq!(controller.detection, DetectionStatus::Scanning);
        controller.handle(ControlMessage::FrameScored(MatchResult {
            score: 0.97,
            at: t + Duration::from_millis(400),
        }));
        assert_eq!(controller.detection, DetectionStatus::Death);

        let events: Vec<StatusEvent> = status_rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            StatusEvent::Role {
                role: SceneRole::Death,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(e, StatusEvent::MatchScore(s) if *s > 0.9)));
    }

    #[test]
    fn test_worker_messages_ignored_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _status_rx) = controller(&dir);
        controller.handle(ControlMessage::CaptureFailed("no display".to_string()));
        controller.handle(ControlMessage::FrameScored(MatchResult {
            score: 1.0,
            at: Instant::now(),
        }));
        assert_eq!(controller.detection, DetectionStatus::Off);
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, status_rx) = controller(&dir);
        let mut detection = controller.store.get().detection.clone();
        detection.threshold_percent = 150;
        controller.handle(ControlMessage::Command(ControlCommand::UpdateConfig(
            ConfigPatch {
                detection: Some(detection),
                ..Default::default()
            },
        )));
        assert_eq!(controller.store.get().detection.threshold_percent, 85);
        assert!(status_rx.try_iter().any(|e| matches!(
            e,
            StatusEvent::Log(entry) if entry.message.starts_with("Settings not saved")
        )));
    }

    #[test]
    fn test_shutdown_ends_run_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auto_connect": false}"#).unwrap();
        let channels = create_channels();
        let controller = Controller::new(
            ConfigStore::open(path),
            channels.control_tx.clone(),
            StatusSender::new(channels.status_tx.clone()),
        );
        channels
            .control_tx
            .send(ControlCommand::Shutdown.into())
            .unwrap();
        controller.run(channels.control_rx);
        assert!(
            channels
                .status_rx
                .try_iter()
                .any(|e| matches!(e, StatusEvent::Obs(ObsStatus::Disconnected)))
        );
    }
}
