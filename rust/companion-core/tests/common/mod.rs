#![allow(dead_code)]

use companion_core::{CompanionConfig, DesktopShell};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Shell double that answers trust prompts with a fixed decision and
/// records everything it is asked to do.
#[derive(Default)]
pub struct RecordingShell {
    approve: bool,
    pub asked: Mutex<Vec<String>>,
    pub notes: Mutex<Vec<String>>,
    pub opened: Mutex<Vec<PathBuf>>,
}

impl RecordingShell {
    pub fn approving() -> Self {
        Self {
            approve: true,
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().unwrap().clone()
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }
}

impl DesktopShell for RecordingShell {
    fn ask_trust(&self, site: &str) -> bool {
        self.asked.lock().unwrap().push(site.to_string());
        self.approve
    }

    fn notify(&self, message: &str) {
        self.notes.lock().unwrap().push(message.to_string());
    }

    fn open(&self, path: &Path) -> io::Result<()> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// Config rooted in `dir` with a canonical cache directory.
pub fn test_config(dir: &Path) -> CompanionConfig {
    let mut config = CompanionConfig::default_with_dir(&dir.join("data"));
    config.cache_dir = dir.join("cache");
    config.ensure_directories().unwrap();
    config
}

/// Replaces the file's content in one rename, so the watcher never sees a
/// half-written state.
pub fn replace_content(path: &Path, content: &[u8]) {
    let tmp = path.with_extension("tmp-write");
    fs::write(&tmp, content).unwrap();
    fs::rename(&tmp, path).unwrap();
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
