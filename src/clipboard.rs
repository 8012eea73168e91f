//! Clipboard copy for snippet mode, via whichever system tool is installed.

use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Picks a clipboard command for this system, if any is available.
pub fn detect_clipboard_command() -> Option<Vec<String>> {
    let wayland = std::env::var_os("WAYLAND_DISPLAY").is_some();
    clipboard_command_for(std::env::consts::OS, wayland, |tool| which::which(tool).is_ok())
}

fn clipboard_command_for(
    os: &str,
    wayland: bool,
    exists: impl Fn(&str) -> bool,
) -> Option<Vec<String>> {
    let mut candidates: Vec<&[&str]> = Vec::new();
    if os == "macos" {
        candidates.push(&["pbcopy"]);
    } else if wayland {
        candidates.push(&["wl-copy"]);
    }
    candidates.push(&["xclip", "-selection", "clipboard"]);
    candidates.push(&["xsel", "--clipboard", "--input"]);

    candidates
        .into_iter()
        .find(|cmd| exists(cmd[0]))
        .map(|cmd| cmd.iter().map(|s| s.to_string()).collect())
}

/// Copies `text` to the clipboard. Returns whether it worked.
pub fn copy_to_clipboard(text: &str) -> bool {
    let Some(cmd) = detect_clipboard_command() else {
        return false;
    };
    debug!("Copying snippet with {:?}", cmd);

    let spawned = Command::new(&cmd[0])
        .args(&cmd[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let Ok(mut child) = spawned else {
        return false;
    };

    let written = child
        .stdin
        .take()
        .map(|mut stdin| stdin.write_all(text.as_bytes()).is_ok())
        .unwrap_or(false);
    let exited_ok = child.wait().map(|s| s.success()).unwrap_or(false);
    written && exited_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macos_prefers_pbcopy() {
        let cmd = clipboard_command_for("macos", false, |_| true).unwrap();
        assert_eq!(cmd, vec!["pbcopy"]);
    }

    #[test]
    fn test_wayland_prefers_wl_copy() {
        let cmd = clipboard_command_for("linux", true, |_| true).unwrap();
        assert_eq!(cmd, vec!["wl-copy"]);
    }

    #[test]
    fn test_x11_falls_back_to_xsel() {
        let cmd = clipboard_command_for("linux", false, |tool| tool == "xsel").unwrap();
        assert_eq!(cmd, vec!["xsel", "--clipboard", "--input"]);
    }

    #[test]
    fn test_no_tool_available() {
        assert!(clipboard_command_for("linux", true, |_| false).is_none());
    }
}
