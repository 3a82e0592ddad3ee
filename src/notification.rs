//! Single-file notification channel.
//!
//! The supervised process signals completion by writing one JSON document to
//! a well-known filename inside the session home. Each appearance of the file
//! is consumed exactly once: read with a bounded retry loop (the writer is
//! not atomic), deleted, and handed to the engine as raw text.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

/// How many read-and-parse attempts before giving up on a partial write.
const READ_ATTEMPTS: u32 = 10;
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Backoff before rearming after a watcher setup failure.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct NotificationChannel {
    dir: PathBuf,
    filename: String,
}

impl NotificationChannel {
    pub fn new(dir: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            filename: filename.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    /// One watch pass: wait for the file, extract its content, delete it.
    ///
    /// Returns `None` when cancelled, when the watcher could not attach, or
    /// when the read budget was exhausted without a complete document. The
    /// owner rearms the pass in a loop.
    pub async fn watch_once(&self, cancel: &mut watch::Receiver<bool>) -> Option<String> {
        if *cancel.borrow() {
            return None;
        }

        let path = self.path();
        if !path.exists() && !self.wait_for_file(&path, cancel).await {
            return None;
        }

        let raw = self.read_complete(&path).await;

        // Delete regardless of read outcome so a truncated file cannot wedge
        // the channel. A concurrent removal is not an error.
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(target: "session_broker::notification", path = %path.display(), error = %err, "failed to delete notification file");
            }
        }

        raw
    }

    /// Block on filesystem events until the file appears or `cancel` fires.
    async fn wait_for_file(&self, path: &Path, cancel: &mut watch::Receiver<bool>) -> bool {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher =
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = event_tx.send(event);
                }
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    tracing::warn!(target: "session_broker::notification", error = %err, "failed to create filesystem watcher");
                    sleep(WATCH_ERROR_BACKOFF).await;
                    return false;
                }
            };

        if let Err(err) = watcher.watch(&self.dir, RecursiveMode::NonRecursive) {
            tracing::warn!(target: "session_broker::notification", dir = %self.dir.display(), error = %err, "failed to watch session home");
            sleep(WATCH_ERROR_BACKOFF).await;
            return false;
        }

        // The file may have landed between the existence check and attach.
        if path.exists() {
            return true;
        }

        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return false;
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(event) if self.names_file(&event) && path.exists() => return true,
                        Some(_) => {}
                        None => return false,
                    }
                }
            }
        }
    }

    fn names_file(&self, event: &notify::Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(OsStr::new(&self.filename)))
    }

    /// Read the file until it parses as a complete JSON document.
    ///
    /// The external process writes non-atomically, so a failed parse means
    /// "not finished yet" and is retried up to the attempt budget.
    async fn read_complete(&self, path: &Path) -> Option<String> {
        for attempt in 1..=READ_ATTEMPTS {
            if let Ok(text) = tokio::fs::read_to_string(path).await {
                if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
                    return Some(text);
                }
            }
            if attempt < READ_ATTEMPTS {
                sleep(READ_RETRY_DELAY).await;
            }
        }
        tracing::warn!(target: "session_broker::notification", path = %path.display(), attempts = READ_ATTEMPTS, "notification never parsed as complete JSON, dropping");
        None
    }
}
