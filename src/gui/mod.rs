//! GUI module for the application.
//!
//! Provides a graphical interface using egui/eframe. The GUI never blocks:
//! it sends commands to the control thread and redraws from the status
//! events it receives back.

pub mod render;
pub mod state;

use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;

use chrono::Local;
use eframe::egui::{self, Vec2};
use tracing::{debug, info};

use crate::config::ConfigPatch;
use crate::monitor::{ControlCommand, ControlMessage, LogEntry, LogLevel, StatusEvent};
use crate::paths;

use state::{GuiState, UiAction};

/// How often the GUI polls for status events while idle.
const REPAINT_INTERVAL: Duration = Duration::from_millis(100);

/// Main GUI application struct.
pub struct GuiApp {
    state: GuiState,
    control_tx: Sender<ControlMessage>,
    status_rx: Receiver<StatusEvent>,
}

impl GuiApp {
    pub fn new(control_tx: Sender<ControlMessage>, status_rx: Receiver<StatusEvent>) -> Self {
        Self {
            state: GuiState::default(),
            control_tx,
            status_rx,
        }
    }

    fn send(&self, command: ControlCommand) {
        if self.control_tx.send(command.into()).is_err() {
            tracing::error!("GUI: control thread is gone");
        }
    }

    fn drain_status(&mut self) {
        while let Ok(event) = self.status_rx.try_recv() {
            self.state.apply(event);
        }
    }

    /// Sends a config patch, or shows why it was rejected.
    fn submit(&mut self, patch: Result<ConfigPatch, String>) {
        match patch {
            Ok(patch) => {
                self.state.validation = None;
                self.send(ControlCommand::UpdateConfig(patch));
            }
            Err(msg) => {
                debug!("GUI: rejected input: {}", msg);
                self.state.validation = Some(msg);
            }
        }
    }

    fn handle(&mut self, action: UiAction) {
        match action {
            UiAction::Connect => {
                // Save first so the connection uses what is on screen
                let patch = self.state.draft.connection_patch(&self.state.config);
                let valid = patch.is_ok();
                self.submit(patch);
                if valid {
                    self.send(ControlCommand::Connect);
                }
            }
            UiAction::Disconnect => self.send(ControlCommand::Disconnect),
            UiAction::RefreshScenes => self.send(ControlCommand::RefreshScenes),
            UiAction::SaveConnection => {
                let patch = self.state.draft.connection_patch(&self.state.config);
                self.submit(patch);
            }
            UiAction::SaveScenes => {
                let patch = self.state.draft.scenes_patch();
                self.submit(Ok(patch));
            }
            UiAction::StartMonitoring => self.send(ControlCommand::StartMonitoring),
            UiAction::StopMonitoring => self.send(ControlCommand::StopMonitoring),
            UiAction::SaveDetection => {
                let patch = self.state.draft.detection_patch(&self.state.config);
                self.submit(patch);
            }
            UiAction::CaptureTemplate => match self.state.draft.template_roi() {
                Ok(roi) => {
                    self.state.validation = None;
                    self.send(ControlCommand::CaptureTemplate { roi });
                }
                Err(msg) => self.state.validation = Some(msg),
            },
            UiAction::LoadTemplate => {
                let request = self
                    .state
                    .draft
                    .template_roi()
                    .and_then(|roi| Ok((self.state.draft.template_file()?, roi)));
                match request {
                    Ok((path, roi)) => {
                        self.state.validation = None;
                        self.send(ControlCommand::LoadTemplate { path, roi });
                    }
                    Err(msg) => self.state.validation = Some(msg),
                }
            }
            UiAction::ClearTemplate => self.send(ControlCommand::ClearTemplate),
            UiAction::SaveLog => self.save_log(),
            UiAction::ClearLog => self.state.log.clear(),
        }
    }

    /// Writes the log panel to a timestamped file in the logs directory.
    fn save_log(&mut self) {
        let name = format!("session-{}.txt", Local::now().format("%Y%m%d-%H%M%S"));
        let path = paths::get_logs_dir().join(name);
        let (level, message) = match state::save_log(&path, &self.state.log) {
            Ok(()) => (LogLevel::Info, format!("Log saved to {}", path.display())),
            Err(e) => (LogLevel::Error, format!("Could not save log: {}", e)),
        };
        info!("GUI: {}", message);
        self.state.apply(StatusEvent::Log(LogEntry {
            at: Local::now(),
            level,
            message,
        }));
    }
}

impl eframe::App for GuiApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_status();
        ctx.request_repaint_after(REPAINT_INTERVAL);

        let mut actions = Vec::new();

        egui::TopBottomPanel::bottom("log_panel")
            .resizable(true)
            .default_height(160.0)
            .show(ctx, |ui| {
                render::render_log(ui, &self.state, &mut actions);
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("OBS Auto Scene");
            ui.add_space(8.0);
            render::render_status(ui, &self.state);

            egui::ScrollArea::vertical().show(ui, |ui| {
                render::render_validation(ui, &self.state);
                render::render_monitoring(ui, &self.state, &mut actions);
                render::render_connection(ui, &mut self.state, &mut actions);
                render::render_scenes(ui, &mut self.state, &mut actions);
                render::render_detection(ui, &mut self.state, &mut actions);
                render::render_template(ui, &mut self.state, &mut actions);
            });
        });

        for action in actions {
            self.handle(action);
        }
    }
}

/// Run the GUI application.
/// This function blocks until the window is closed.
pub fn run_gui(
    control_tx: Sender<ControlMessage>,
    status_rx: Receiver<StatusEvent>,
) -> eframe::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size(Vec2::new(560.0, 760.0))
            .with_min_inner_size(Vec2::new(420.0, 480.0))
            .with_title("OBS Auto Scene")
            // Disable drag-and-drop to avoid COM conflict with RoInitialize (multithreaded)
            .with_drag_and_drop(false),
        ..Default::default()
    };

    info!("GUI: starting");
    eframe::run_native(
        "OBS Auto Scene",
        options,
        Box::new(|_cc| Ok(Box::new(GuiApp::new(control_tx, status_rx)))),
    )
}
