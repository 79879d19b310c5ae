//! GUI rendering functions.
//!
//! Each section draws from `GuiState` and pushes what the user clicked into
//! `actions`; nothing here talks to the control thread directly.

use eframe::egui::{self, Color32, RichText};

use super::state::{GuiState, UiAction};
use crate::detection::DetectionBackend;
use crate::monitor::{DetectionStatus, LogLevel, ObsStatus, SceneRole};

const GREEN: Color32 = Color32::from_rgb(0, 150, 0);
const BLUE: Color32 = Color32::from_rgb(0, 120, 200);
const AMBER: Color32 = Color32::from_rgb(200, 150, 0);
const RED: Color32 = Color32::from_rgb(200, 0, 0);

fn badge(ui: &mut egui::Ui, label: &str, text: impl Into<String>, color: Color32) -> egui::Response {
    ui.label(format!("{}:", label));
    ui.label(RichText::new(text).color(color).strong())
}

fn section_gap(ui: &mut egui::Ui) {
    ui.add_space(8.0);
    ui.separator();
    ui.add_space(8.0);
}

/// Status badges across the top.
pub fn render_status(ui: &mut egui::Ui, state: &GuiState) {
    ui.horizontal_wrapped(|ui| {
        let obs_color = match &state.obs {
            ObsStatus::Connected { .. } => GREEN,
            ObsStatus::Connecting => BLUE,
            ObsStatus::Disconnected => Color32::GRAY,
            ObsStatus::Failed(_) => RED,
        };
        badge(ui, "OBS", state.obs.to_string(), obs_color);
        ui.add_space(12.0);

        let (monitor_text, monitor_color) = if state.monitoring {
            ("Running", GREEN)
        } else {
            ("Stopped", Color32::GRAY)
        };
        badge(ui, "Monitoring", monitor_text, monitor_color);
        ui.add_space(12.0);

        let role_color = match state.role {
            Some(SceneRole::Live) => GREEN,
            Some(SceneRole::Map) => BLUE,
            Some(SceneRole::Death) => RED,
            None => Color32::GRAY,
        };
        let role_text = state
            .role
            .map(|role| role.to_string())
            .unwrap_or_else(|| "-".to_string());
        badge(ui, "Role", role_text, role_color);
    });

    ui.horizontal_wrapped(|ui| {
        let detection_color = match state.detection {
            DetectionStatus::Off => Color32::GRAY,
            DetectionStatus::Scanning => GREEN,
            DetectionStatus::Death => RED,
            DetectionStatus::NoTemplate
            | DetectionStatus::TemplateTooLarge
            | DetectionStatus::CaptureUnavailable => AMBER,
        };
        badge(ui, "Detection", state.detection.to_string(), detection_color);
        if let Some(score) = state.match_score {
            ui.label(format!("({:.1}%)", score * 100.0));
        }
        ui.add_space(12.0);

        match &state.key_hook {
            Some((true, detail)) => {
                badge(ui, "Key hook", "Available", GREEN).on_hover_text(detail);
            }
            Some((false, detail)) => {
                badge(ui, "Key hook", "Not available", AMBER).on_hover_text(detail);
            }
            None => {
                badge(ui, "Key hook", "-", Color32::GRAY);
            }
        }
        ui.add_space(12.0);

        let scene = state.current_scene.as_deref().unwrap_or("-");
        badge(ui, "Scene", scene, Color32::GRAY);
    });
}

/// OBS host, port and password with connect controls.
pub fn render_connection(ui: &mut egui::Ui, state: &mut GuiState, actions: &mut Vec<UiAction>) {
    section_gap(ui);
    ui.heading("OBS connection");

    egui::Grid::new("connection_grid")
        .num_columns(2)
        .show(ui, |ui| {
            ui.label("Host:");
            ui.text_edit_singleline(&mut state.draft.host);
            ui.end_row();

            ui.label("Port:");
            ui.add(egui::TextEdit::singleline(&mut state.draft.port).desired_width(80.0));
            ui.end_row();

            ui.label("Password:");
            ui.add(egui::TextEdit::singleline(&mut state.draft.password).password(true));
            ui.end_row();
        });

    ui.checkbox(&mut state.draft.auto_connect, "Connect at startup");
    ui.checkbox(&mut state.draft.auto_monitor, "Start monitoring after connecting");

    ui.horizontal(|ui| {
        if ui.button("Save").clicked() {
            actions.push(UiAction::SaveConnection);
        }
        let connected = state.obs.is_connected();
        let connecting = state.obs == ObsStatus::Connecting;
        ui.add_enabled_ui(!connected && !connecting, |ui| {
            if ui.button("Connect").clicked() {
                actions.push(UiAction::Connect);
            }
        });
        ui.add_enabled_ui(connected, |ui| {
            if ui.button("Disconnect").clicked() {
                actions.push(UiAction::Disconnect);
            }
            if ui.button("Refresh scenes").clicked() {
                actions.push(UiAction::RefreshScenes);
            }
        });
    });
}

fn scene_combo(ui: &mut egui::Ui, label: &str, selected: &mut String, scenes: &[String]) {
    let shown = if selected.is_empty() {
        "(none)".to_string()
    } else {
        selected.clone()
    };
    egui::ComboBox::from_label(label)
        .selected_text(shown)
        .show_ui(ui, |ui| {
            ui.selectable_value(selected, String::new(), "(none)");
            for name in scenes {
                ui.selectable_value(selected, name.clone(), name);
            }
            // Keep a stored name selectable even if OBS no longer lists it
            if !selected.is_empty() && !scenes.contains(selected) {
                let missing = selected.clone();
                ui.selectable_value(selected, missing.clone(), format!("{} (missing)", missing));
            }
        });
}

/// Scene role dropdowns.
pub fn render_scenes(ui: &mut egui::Ui, state: &mut GuiState, actions: &mut Vec<UiAction>) {
    section_gap(ui);
    ui.heading("Scenes");
    if state.scenes.is_empty() {
        ui.label(RichText::new("Connect to OBS to load the scene list").weak());
    }

    let scenes = state.scenes.clone();
    scene_combo(ui, "Live", &mut state.draft.scenes.live, &scenes);
    scene_combo(ui, "Map", &mut state.draft.scenes.map, &scenes);
    scene_combo(ui, "Death", &mut state.draft.scenes.death, &scenes);

    if ui.button("Save scenes").clicked() {
        actions.push(UiAction::SaveScenes);
    }
}

/// Start/stop buttons.
pub fn render_monitoring(ui: &mut egui::Ui, state: &GuiState, actions: &mut Vec<UiAction>) {
    section_gap(ui);
    ui.horizontal(|ui| {
        ui.add_enabled_ui(!state.monitoring, |ui| {
            if ui.button(RichText::new("▶ Start monitoring").size(16.0)).clicked() {
                actions.push(UiAction::StartMonitoring);
            }
        });
        ui.add_space(20.0);
        ui.add_enabled_ui(state.monitoring, |ui| {
            if ui.button(RichText::new("◼ Stop").size(16.0)).clicked() {
                actions.push(UiAction::StopMonitoring);
            }
        });
    });
}

/// Threshold, backend, interval, capture target and map key.
pub fn render_detection(ui: &mut egui::Ui, state: &mut GuiState, actions: &mut Vec<UiAction>) {
    section_gap(ui);
    ui.heading("Detection");
    let draft = &mut state.draft;

    egui::Grid::new("detection_grid")
        .num_columns(2)
        .show(ui, |ui| {
            ui.label("Threshold:");
            ui.add(egui::Slider::new(&mut draft.threshold_percent, 0..=100).suffix("%"));
            ui.end_row();

            ui.label("Method:");
            ui.horizontal(|ui| {
                ui.selectable_value(&mut draft.backend, DetectionBackend::Template, "Template match");
                ui.selectable_value(&mut draft.backend, DetectionBackend::ScreenDiff, "Screen diff");
            });
            ui.end_row();

            ui.label("Interval:");
            ui.add(
                egui::DragValue::new(&mut draft.interval_ms)
                    .range(50..=5000)
                    .suffix(" ms"),
            );
            ui.end_row();

            ui.label("Capture:");
            ui.horizontal(|ui| {
                ui.selectable_value(&mut draft.capture_window, false, "Primary monitor");
                ui.selectable_value(&mut draft.capture_window, true, "Window");
            });
            ui.end_row();

            if draft.capture_window {
                ui.label("Executable:");
                ui.add(egui::TextEdit::singleline(&mut draft.process_name).hint_text("game.exe"));
                ui.end_row();
            }

            ui.label("Map key:");
            ui.add(egui::TextEdit::singleline(&mut draft.map_key).desired_width(80.0));
            ui.end_row();

            ui.label("Respawn delay:");
            ui.add(
                egui::DragValue::new(&mut draft.respawn_delay_ms)
                    .range(0..=10000)
                    .suffix(" ms"),
            );
            ui.end_row();
        });

    if ui.button("Save detection").clicked() {
        actions.push(UiAction::SaveDetection);
    }
}

/// Template region and capture/clear buttons.
pub fn render_template(ui: &mut egui::Ui, state: &mut GuiState, actions: &mut Vec<UiAction>) {
    section_gap(ui);
    ui.heading("Death template");

    match &state.config.death_template {
        Some(t) => ui.label(format!("Stored: {}x{} at {}", t.width, t.height, t.roi)),
        None => ui.label(RichText::new("No template captured").color(AMBER)),
    };

    let draft = &mut state.draft;
    ui.horizontal(|ui| {
        ui.label("X");
        ui.add(egui::DragValue::new(&mut draft.roi_x));
        ui.label("Y");
        ui.add(egui::DragValue::new(&mut draft.roi_y));
        ui.label("W");
        ui.add(egui::DragValue::new(&mut draft.roi_width).range(1..=4096));
        ui.label("H");
        ui.add(egui::DragValue::new(&mut draft.roi_height).range(1..=4096));
    });

    ui.horizontal(|ui| {
        ui.label("Image file");
        ui.add(
            egui::TextEdit::singleline(&mut draft.template_path)
                .hint_text("C:\\path\\to\\death.png")
                .desired_width(260.0),
        );
    });

    let has_template = state.has_template();
    ui.horizontal(|ui| {
        if ui.button("Capture from screen").clicked() {
            actions.push(UiAction::CaptureTemplate);
        }
        if ui.button("Load from file").clicked() {
            actions.push(UiAction::LoadTemplate);
        }
        ui.add_enabled_ui(has_template, |ui| {
            if ui.button("Clear").clicked() {
                actions.push(UiAction::ClearTemplate);
            }
        });
    });
}

/// Validation message, if the last edit was rejected.
pub fn render_validation(ui: &mut egui::Ui, state: &GuiState) {
    if let Some(msg) = &state.validation {
        ui.add_space(4.0);
        ui.label(RichText::new(msg).color(RED));
    }
}

/// Scrolling log panel.
pub fn render_log(ui: &mut egui::Ui, state: &GuiState, actions: &mut Vec<UiAction>) {
    ui.horizontal(|ui| {
        ui.strong("Log");
        if ui.small_button("Save").clicked() {
            actions.push(UiAction::SaveLog);
        }
        if ui.small_button("Clear").clicked() {
            actions.push(UiAction::ClearLog);
        }
    });
    egui::ScrollArea::vertical()
        .stick_to_bottom(true)
        .auto_shrink([false, false])
        .show(ui, |ui| {
            for entry in &state.log {
                let color = match entry.level {
                    LogLevel::Info => ui.visuals().text_color(),
                    LogLevel::Warn => AMBER,
                    LogLevel::Error => RED,
                };
                ui.label(
                    RichText::new(format!("{} {}", entry.at.format("%H:%M:%S"), entry.message))
                        .color(color)
                        .monospace(),
                );
            }
        });
}
