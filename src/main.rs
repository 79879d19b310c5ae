//! OBS Auto Scene
//!
//! Switches OBS scenes automatically while streaming: a map scene while the
//! map key is held, a death scene while the death screen is on the game
//! capture, and the live scene otherwise.

// Hide console window on Windows for GUI mode
#![windows_subsystem = "windows"]

mod capture;
mod config;
mod detection;
mod error;
mod gui;
mod input;
mod logging;
mod monitor;
mod obs;
mod paths;

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use std::io::Write;

use config::ConfigStore;
use monitor::{ControlCommand, create_channels, spawn_control};

/// Appends a panic to the log file directly; the tracing writer may already
/// be gone when the hook runs.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_default();
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let log_msg = format!(
            "{} [PANIC] thread '{}'{} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            thread,
            location,
            msg
        );
        eprint!("{}", log_msg);
        let log_path = paths::get_logs_dir().join(logging::LOG_FILE_NAME);
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let _ = file.write_all(log_msg.as_bytes());
        }
    }));
}

fn main() -> Result<()> {
    install_panic_hook();

    #[cfg(windows)]
    unsafe {
        windows::Win32::System::WinRT::RoInitialize(
            windows::Win32::System::WinRT::RO_INIT_MULTITHREADED,
        )
        .context("Failed to initialize WinRT")?
    };

    paths::ensure_directories().context("Failed to create output directories")?;

    let config_path = paths::config_file_path();
    let log_level = ConfigStore::open(config_path.clone()).get().log_level.clone();
    let _log_guard = logging::init(&log_level, &paths::get_logs_dir())?;
    tracing::info!("OBS Auto Scene {} starting", env!("CARGO_PKG_VERSION"));
    // Opened again so load warnings reach the log
    let store = ConfigStore::open(config_path);

    let channels = create_channels();
    let shutdown_tx = channels.control_tx.clone();
    let control = spawn_control(
        store,
        channels.control_tx.clone(),
        channels.control_rx,
        channels.status_tx,
    )
    .context("Failed to spawn control thread")?;

    let gui_result = gui::run_gui(channels.control_tx, channels.status_rx);

    let _ = shutdown_tx.send(ControlCommand::Shutdown.into());
    if control.join().is_err() {
        tracing::error!("Control thread panicked");
    }

    match gui_result {
        Ok(()) => {
            tracing::info!("GUI application exited normally");
            Ok(())
        }
        Err(e) => {
            tracing::error!("GUI error: {}", e);
            Err(anyhow!("GUI error: {}", e))
        }
    }
}
