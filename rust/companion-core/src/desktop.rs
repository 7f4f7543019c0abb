//! Seam to the user's desktop: trust prompts, notifications, launching editors.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

pub trait DesktopShell: Send + Sync {
    /// Asks whether `site` may open documents on this machine.
    fn ask_trust(&self, site: &str) -> bool;

    /// Fire-and-forget user notification.
    fn notify(&self, message: &str);

    /// Opens `path` with the OS default application.
    fn open(&self, path: &Path) -> io::Result<()>;
}

/// Terminal-backed shell used by the CLI.
#[derive(Debug, Default)]
pub struct ConsoleShell;

impl DesktopShell for ConsoleShell {
    fn ask_trust(&self, site: &str) -> bool {
        if !io::stdin().is_terminal() {
            log::warn!("cannot ask about {site:?}: no terminal, rejecting");
            return false;
        }

        eprint!("Allow site {site:?} to open files with this computer? [y/N] ");
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }

    fn notify(&self, message: &str) {
        log::info!("notification: {message}");
        eprintln!("[companion] {message}");
    }

    fn open(&self, path: &Path) -> io::Result<()> {
        spawn_reaped(open_command(path)).map(|_| ())
    }
}

/// Spawns `cmd` with null stdio and waits for it on a detached thread, so a
/// long-running server does not accumulate zombie launcher processes.
fn spawn_reaped(mut cmd: Command) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    thread::Builder::new()
        .name("companion-open".into())
        .spawn(move || {
            let status = child.wait();
            if let Ok(status) = &status {
                if !status.success() {
                    log::debug!("launcher exited with {status}");
                }
            }
            status
        })
}

#[cfg(target_os = "macos")]
fn open_command(path: &Path) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(path);
    cmd
}

#[cfg(target_os = "windows")]
fn open_command(path: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", "start", ""]).arg(path);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn open_command(path: &Path) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(path);
    cmd
}
