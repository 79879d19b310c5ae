//! Map key state polling.
//!
//! The key is polled on its own thread so a slow capture or OBS request can
//! never delay key delivery. Only changes are forwarded, each stamped with
//! the monotonic time it was observed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::KeySourceError;
use crate::monitor::events::ControlMessage;

/// A virtual-key code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualKey(pub u16);

/// Reports whether the designated key is currently held.
pub trait KeySource {
    fn is_held(&mut self) -> bool;
}

/// Parses a key name such as "G", "7", "F5", "Tab" or "Mouse4".
pub fn parse_key_name(name: &str) -> Result<VirtualKey, KeySourceError> {
    let trimmed = name.trim();
    let upper = trimmed.to_ascii_uppercase();
    let unknown = || KeySourceError::UnknownKey(trimmed.to_string());

    if upper.len() == 1 {
        let c = upper.as_bytes()[0];
        if c.is_ascii_uppercase() || c.is_ascii_digit() {
            return Ok(VirtualKey(c as u16));
        }
        if c == b'`' || c == b'~' {
            return Ok(VirtualKey(0xC0));
        }
        return Err(unknown());
    }

    if let Some(n) = upper.strip_prefix('F').and_then(|n| n.parse::<u16>().ok()) {
        return match n {
            1..=24 => Ok(VirtualKey(0x70 + n - 1)),
            _ => Err(unknown()),
        };
    }
    if let Some(n) = upper.strip_prefix("NUMPAD").and_then(|n| n.parse::<u16>().ok()) {
        return match n {
            0..=9 => Ok(VirtualKey(0x60 + n)),
            _ => Err(unknown()),
        };
    }

    let code = match upper.as_str() {
        "TAB" => 0x09,
        "SPACE" => 0x20,
        "ENTER" | "RETURN" => 0x0D,
        "BACKSPACE" => 0x08,
        "ESC" | "ESCAPE" => 0x1B,
        "CAPSLOCK" => 0x14,
        "SHIFT" => 0x10,
        "CTRL" | "CONTROL" => 0x11,
        "ALT" => 0x12,
        "LSHIFT" => 0xA0,
        "RSHIFT" => 0xA1,
        "LCTRL" => 0xA2,
        "RCTRL" => 0xA3,
        "LALT" => 0xA4,
        "RALT" => 0xA5,
        "LEFT" => 0x25,
        "UP" => 0x26,
        "RIGHT" => 0x27,
        "DOWN" => 0x28,
        "PAGEUP" => 0x21,
        "PAGEDOWN" => 0x22,
        "END" => 0x23,
        "HOME" => 0x24,
        "INSERT" => 0x2D,
        "DELETE" => 0x2E,
        "MOUSE3" | "MIDDLEMOUSE" => 0x04,
        "MOUSE4" => 0x05,
        "MOUSE5" => 0x06,
        _ => return Err(unknown()),
    };
    Ok(VirtualKey(code))
}

#[cfg(windows)]
mod win32 {
    use windows::Win32::UI::Input::KeyboardAndMouse::GetAsyncKeyState;

    use super::{KeySource, VirtualKey};

    /// Global key state via `GetAsyncKeyState`; works while other
    /// applications have focus.
    pub struct AsyncKeyState {
        pub key: VirtualKey,
    }

    impl KeySource for AsyncKeyState {
        fn is_held(&mut self) -> bool {
            // Most significant bit set means the key is down
            let state = unsafe { GetAsyncKeyState(self.key.0 as i32) };
            (state as u16 & 0x8000) != 0
        }
    }
}

/// Opens the system key source for `key_name`.
pub fn open_key_source(key_name: &str) -> Result<Box<dyn KeySource>, KeySourceError> {
    let key = parse_key_name(key_name)?;
    #[cfg(windows)]
    {
        Ok(Box::new(win32::AsyncKeyState { key }))
    }
    #[cfg(not(windows))]
    {
        let _ = key;
        Err(KeySourceError::Unavailable(
            "global key state is only available on Windows".to_string(),
        ))
    }
}

/// Polls `source` until `stop` is set or the receiver is gone.
///
/// Sends the first observed state, then every change.
pub fn run_key_listener(
    source: &mut dyn KeySource,
    poll_interval: Duration,
    tx: &Sender<ControlMessage>,
    stop: &AtomicBool,
) {
    let mut last: Option<bool> = None;
    while !stop.load(Ordering::SeqCst) {
        let held = source.is_held();
        if last != Some(held) {
            last = Some(held);
            let sample = ControlMessage::KeySample {
                held,
                at: Instant::now(),
            };
            if tx.send(sample).is_err() {
                break;
            }
        }
        thread::sleep(poll_interval);
    }
}

/// Spawns the key listener thread.
///
/// Availability of the key hook is reported through the channel either way.
pub fn spawn_key_listener(
    key_name: String,
    poll_interval: Duration,
    tx: Sender<ControlMessage>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("key-listener".to_string())
        .spawn(move || {
            let mut source = match open_key_source(&key_name) {
                Ok(source) => source,
                Err(e) => {
                    warn!("Key listener not started: {}", e);
                    let _ = tx.send(ControlMessage::KeyHook {
                        available: false,
                        detail: e.to_string(),
                    });
                    return;
                }
            };
            info!("Key listener started for {}", key_name);
            let _ = tx.send(ControlMessage::KeyHook {
                available: true,
                detail: format!("listening for {}", key_name),
            });
            run_key_listener(source.as_mut(), poll_interval, &tx, &stop);
            debug!("Key listener stopped");
        })
}
