//! Window discovery by process executable name.

#[cfg(windows)]
pub use win32::{client_area, find_window_by_process};

/// True if the executable at `full_path` is exactly `wanted` (case-insensitive).
///
/// Only the file name is compared, so "game.exe" does not match
/// "game-launcher.exe" or a directory called "game.exe".
pub fn executable_matches(full_path: &str, wanted: &str) -> bool {
    let name = full_path.rsplit(['\\', '/']).next().unwrap_or(full_path);
    !wanted.is_empty() && name.eq_ignore_ascii_case(wanted.trim())
}

#[cfg(windows)]
mod win32 {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use tracing::debug;

    use windows::Win32::Foundation::{BOOL, HWND, LPARAM, POINT, RECT, TRUE};
    use windows::Win32::Graphics::Gdi::ClientToScreen;
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
        QueryFullProcessImageNameW,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetClientRect, GetWindowRect, GetWindowTextLengthW, GetWindowThreadProcessId,
        IsWindowVisible,
    };

    use super::executable_matches;
    use crate::detection::RegionOfInterest;
    use crate::error::CaptureError;

    /// Finds the first visible, titled top-level window whose process
    /// executable is `process_name`.
    pub fn find_window_by_process(process_name: &str) -> Result<HWND, CaptureError> {
        struct EnumData<'a> {
            wanted: &'a str,
            hwnd: Option<HWND>,
        }

        unsafe extern "system" fn enum_callback(hwnd: HWND, lparam: LPARAM) -> BOOL {
            unsafe {
                let data = &mut *(lparam.0 as *mut EnumData);

                if !IsWindowVisible(hwnd).as_bool() {
                    return TRUE;
                }
                // Untitled windows are rarely main windows
                if GetWindowTextLengthW(hwnd) == 0 {
                    return TRUE;
                }

                let mut process_id: u32 = 0;
                GetWindowThreadProcessId(hwnd, Some(&mut process_id));
                if process_id == 0 {
                    return TRUE;
                }

                let Ok(process_handle) =
                    OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, process_id)
                else {
                    return TRUE;
                };

                let mut name_buf: Vec<u16> = vec![0; 1024];
                let mut len = name_buf.len() as u32;
                let result = QueryFullProcessImageNameW(
                    process_handle,
                    PROCESS_NAME_WIN32,
                    windows::core::PWSTR(name_buf.as_mut_ptr()),
                    &mut len,
                );
                let _ = windows::Win32::Foundation::CloseHandle(process_handle);
                if result.is_err() || len == 0 {
                    return TRUE;
                }

                let full_path = OsString::from_wide(&name_buf[..len as usize])
                    .to_string_lossy()
                    .to_string();
                if executable_matches(&full_path, data.wanted) {
                    debug!("Matched window of {} ({})", full_path, process_id);
                    data.hwnd = Some(hwnd);
                    return BOOL(0); // Stop enumeration
                }
                TRUE
            }
        }

        let mut data = EnumData {
            wanted: process_name,
            hwnd: None,
        };
        unsafe {
            // EnumWindows returns FALSE when the callback stops it early
            let _ = EnumWindows(Some(enum_callback), LPARAM(&mut data as *mut _ as isize));
        }

        data.hwnd.ok_or_else(|| {
            CaptureError::TargetNotFound(format!("no visible window of {}", process_name))
        })
    }

    /// The client area of `hwnd` relative to its window origin.
    ///
    /// Window captures include the title bar and borders; this is the
    /// rectangle to crop them to.
    pub fn client_area(hwnd: HWND) -> Result<RegionOfInterest, CaptureError> {
        let gone = |_| CaptureError::TargetNotFound("window was closed".to_string());

        let mut client_rect = RECT::default();
        unsafe { GetClientRect(hwnd, &mut client_rect).map_err(gone)? };

        let mut client_origin = POINT { x: 0, y: 0 };
        if !unsafe { ClientToScreen(hwnd, &mut client_origin) }.as_bool() {
            return Err(CaptureError::TargetNotFound("window was closed".to_string()));
        }

        let mut window_rect = RECT::default();
        unsafe { GetWindowRect(hwnd, &mut window_rect).map_err(gone)? };

        RegionOfInterest::new(
            (client_origin.x - window_rect.left).max(0) as u32,
            (client_origin.y - window_rect.top).max(0) as u32,
            (client_rect.right - client_rect.left).max(0) as u32,
            (client_rect.bottom - client_rect.top).max(0) as u32,
        )
        .ok_or_else(|| CaptureError::Failed("window has no client area (minimized?)".to_string()))
    }
}
