use std::path::PathBuf;
use std::sync::OnceLock;

const APP_DIR_NAME: &str = "obs-autoscene";
const CONFIG_FILE_NAME: &str = "config.json";

static EXE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the directory containing the executable.
pub fn get_exe_dir() -> &'static PathBuf {
    EXE_DIR.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

/// Returns the logs directory: `<exe_dir>/logs/`
pub fn get_logs_dir() -> PathBuf {
    get_exe_dir().join("logs")
}

/// Returns the config directory: `<config_dir>/obs-autoscene/`, or the
/// executable directory when the platform has no config directory.
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| get_exe_dir().clone())
}

pub fn config_file_path() -> PathBuf {
    get_config_dir().join(CONFIG_FILE_NAME)
}

/// Ensures all output directories exist. Call at startup.
pub fn ensure_directories() -> std::io::Result<()> {
    std::fs::create_dir_all(get_logs_dir())?;
    std::fs::create_dir_all(get_config_dir())?;
    Ok(())
}
