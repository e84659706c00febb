//! Windows clipboard + synthetic paste chord, adapted from the teacher's
//! `text_injector`. The keystroke-per-character Unicode path is gone — a
//! failed paste attempt becomes a `clipboard-only` outcome, never a retry.

use std::{thread, time::Duration};

use windows_sys::Win32::Foundation::HWND;
use windows_sys::Win32::System::DataExchange::{CloseClipboard, EmptyClipboard, OpenClipboard, SetClipboardData};
use windows_sys::Win32::System::Memory::{GlobalAlloc, GlobalLock, GlobalUnlock, GMEM_MOVEABLE};
use windows_sys::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows_sys::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYEVENTF_KEYUP, VK_CONTROL, VK_SHIFT, VK_V,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

use super::PasteAttempt;
use crate::session::SurfaceClass;

const CF_UNICODETEXT: u32 = 13;

pub(super) fn set_clipboard_unicode_text(text: &str) -> Result<(), String> {
    let mut utf16: Vec<u16> = text.encode_utf16().collect();
    utf16.push(0);
    let bytes = utf16.len() * std::mem::size_of::<u16>();

    if !open_clipboard_with_retry(std::ptr::null_mut()) {
        return Err("OpenClipboard failed".into());
    }

    // SAFETY: clipboard handle management follows the documented Win32
    // open/alloc/lock/set/close sequence; `hmem` ownership transfers to the
    // system clipboard on a successful `SetClipboardData`.
    let result = unsafe {
        if EmptyClipboard() == 0 {
            Err("EmptyClipboard failed".to_string())
        } else {
            let hmem = GlobalAlloc(GMEM_MOVEABLE, bytes);
            if hmem.is_null() {
                Err("GlobalAlloc failed for clipboard text".to_string())
            } else {
                let dst = GlobalLock(hmem) as *mut u16;
                if dst.is_null() {
                    Err("GlobalLock failed for clipboard text".to_string())
                } else {
                    std::ptr::copy_nonoverlapping(utf16.as_ptr(), dst, utf16.len());
                    let _ = GlobalUnlock(hmem);
                    let set = SetClipboardData(CF_UNICODETEXT, hmem as *mut _);
                    if set.is_null() {
                        Err("SetClipboardData(CF_UNICODETEXT) failed".to_string())
                    } else {
                        Ok(())
                    }
                }
            }
        }
    };

    unsafe {
        CloseClipboard();
    }
    result
}

fn open_clipboard_with_retry(owner: HWND) -> bool {
    for _ in 0..8 {
        if unsafe { OpenClipboard(owner) != 0 } {
            return true;
        }
        thread::sleep(Duration::from_millis(8));
    }
    false
}

fn foreground_process_name() -> Option<String> {
    use std::path::Path;
    use windows_sys::Win32::Foundation::CloseHandle;

    unsafe {
        let hwnd = GetForegroundWindow();
        if hwnd.is_null() {
            return None;
        }
        let mut pid = 0u32;
        let _ = GetWindowThreadProcessId(hwnd, &mut pid);
        if pid == 0 {
            return None;
        }
        let hproc = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if hproc.is_null() {
            return None;
        }
        let mut buf = vec![0u16; 1024];
        let mut len = buf.len() as u32;
        let ok = QueryFullProcessImageNameW(hproc, PROCESS_NAME_WIN32, buf.as_mut_ptr(), &mut len);
        let _ = CloseHandle(hproc);
        if ok == 0 || len == 0 {
            return None;
        }
        let full = String::from_utf16_lossy(&buf[..len as usize]);
        let exe = Path::new(&full).file_name()?.to_string_lossy().to_ascii_lowercase();
        Some(exe)
    }
}

fn is_terminal_process(process_name: &str) -> bool {
    matches!(
        process_name,
        "warp.exe"
            | "windowsterminal.exe"
            | "wezterm-gui.exe"
            | "alacritty.exe"
            | "cmd.exe"
            | "conhost.exe"
            | "powershell.exe"
            | "pwsh.exe"
            | "mintty.exe"
    )
}

fn send_key_chord(modifiers: &[u16], key: u16) -> Result<(), String> {
    let mut inputs: Vec<INPUT> = Vec::with_capacity(modifiers.len() * 2 + 2);

    for &vk in modifiers {
        inputs.push(key_input(vk, 0));
    }
    inputs.push(key_input(key, 0));
    inputs.push(key_input(key, KEYEVENTF_KEYUP));
    for &vk in modifiers.iter().rev() {
        inputs.push(key_input(vk, KEYEVENTF_KEYUP));
    }

    // SAFETY: `inputs` is a fully-initialized `Vec<INPUT>` alive for the call.
    let sent = unsafe {
        SendInput(
            inputs.len() as u32,
            inputs.as_ptr(),
            std::mem::size_of::<INPUT>() as i32,
        )
    };
    if sent != inputs.len() as u32 {
        let win_err = std::io::Error::last_os_error();
        return Err(format!(
            "SendInput chord sent {sent}/{} events (os_error={win_err})",
            inputs.len()
        ));
    }
    Ok(())
}

fn key_input(vk: u16, flags: u32) -> INPUT {
    INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: vk,
                wScan: 0,
                dwFlags: flags,
                time: 0,
                dwExtraInfo: 0,
            },
        },
    }
}

/// One paste attempt: clipboard is assumed already populated by the caller.
/// Tries the terminal chord first on a recognized terminal process (some
/// terminals bind Ctrl+V to something else and expect Ctrl+Shift+V), the
/// standard chord everywhere else.
///
/// Unlike a desktop clipboard manager's "flash clipboard" trick, the
/// dictated text is left on the clipboard afterward rather than restored —
/// the clipboard must stay populated with it whether or not the paste
/// itself lands, per the delivery contract.
pub(super) fn attempt_paste(surface: SurfaceClass, _terminal_paste_chord: Option<&str>) -> PasteAttempt {
    let target_proc = foreground_process_name().unwrap_or_default();
    let is_terminal = surface == SurfaceClass::Terminal || is_terminal_process(&target_proc);

    let result = if is_terminal {
        send_key_chord(&[VK_CONTROL, VK_SHIFT], VK_V).or_else(|_| send_key_chord(&[VK_CONTROL], VK_V))
    } else {
        send_key_chord(&[VK_CONTROL], VK_V).or_else(|_| send_key_chord(&[VK_CONTROL, VK_SHIFT], VK_V))
    };

    match result {
        Ok(()) => PasteAttempt::Succeeded,
        Err(_) => PasteAttempt::Refused,
    }
}
