//! Best-effort persistence for the draft and the transcript.
//!
//! Saves are debounced and fire-and-forget: the panel hands the latest
//! value to a background task, rapid updates coalesce to the last one,
//! and failures are logged rather than surfaced to the session core.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use crate::core::message::ChatMessage;

const DRAFT_FILE: &str = "draft.json";
const HISTORY_FILE: &str = "history.json";
const DEBOUNCE: Duration = Duration::from_millis(400);

#[derive(serde::Serialize, serde::Deserialize)]
struct DraftRecord {
    text: String,
}

/// File-backed storage for one chat panel.
#[derive(Clone)]
pub struct PanelStorage {
    dir: PathBuf,
}

impl PanelStorage {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let dirs = ProjectDirs::from("org", "permacommons", "parley")
            .ok_or("Could not determine a data directory for this platform")?;
        Ok(Self::at(dirs.data_dir().to_path_buf()))
    }

    /// Storage rooted at an explicit directory (used by tests).
    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn draft_path(&self) -> PathBuf {
        self.dir.join(DRAFT_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn load_draft(&self) -> Option<String> {
        let raw = fs::read_to_string(self.draft_path()).ok()?;
        let record: DraftRecord = serde_json::from_str(&raw).ok()?;
        Some(record.text)
    }

    pub fn load_history(&self) -> Option<Vec<ChatMessage>> {
        let raw = fs::read_to_string(self.history_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save_draft(&self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        let record = DraftRecord {
            text: text.to_string(),
        };
        self.write_atomic(&self.draft_path(), &serde_json::to_vec(&record)?)
    }

    pub fn save_history(&self, messages: &[ChatMessage]) -> Result<(), Box<dyn std::error::Error>> {
        self.write_atomic(&self.history_path(), &serde_json::to_vec(messages)?)
    }

    /// Remove both files. Used by `clear_all`, which empties transcript
    /// and draft together.
    pub fn clear(&self) -> Result<(), Box<dyn std::error::Error>> {
        for path in [self.draft_path(), self.history_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(path)?;
        Ok(())
    }
}

enum SaveJob {
    Draft(String),
    History(Vec<ChatMessage>),
    Flush,
}

/// Debounced writer: keeps only the newest pending draft and history,
/// writes them after a quiet period, and flushes whatever is pending
/// when the sender side goes away.
#[derive(Clone)]
pub struct DebouncedSaver {
    tx: mpsc::UnboundedSender<SaveJob>,
}

impl DebouncedSaver {
    pub fn spawn(storage: PanelStorage) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_saver(storage, rx));
        Self { tx }
    }

    pub fn save_draft_debounced(&self, text: impl Into<String>) {
        let _ = self.tx.send(SaveJob::Draft(text.into()));
    }

    pub fn save_history_debounced(&self, messages: Vec<ChatMessage>) {
        let _ = self.tx.send(SaveJob::History(messages));
    }

    /// Write anything pending immediately (used on teardown and by
    /// tests; normal operation relies on the debounce window).
    pub fn flush(&self) {
        let _ = self.tx.send(SaveJob::Flush);
    }
}

async fn run_saver(storage: PanelStorage, mut rx: mpsc::UnboundedReceiver<SaveJob>) {
    let mut pending_draft: Option<String> = None;
    let mut pending_history: Option<Vec<ChatMessage>> = None;

    loop {
        let has_pending = pending_draft.is_some() || pending_history.is_some();
        tokio::select! {
            job = rx.recv() => match job {
                Some(SaveJob::Draft(text)) => pending_draft = Some(text),
                Some(SaveJob::History(messages)) => pending_history = Some(messages),
                Some(SaveJob::Flush) | None => {
                    write_pending(&storage, &mut pending_draft, &mut pending_history);
                    if rx.is_closed() && pending_draft.is_none() && pending_history.is_none() {
                        break;
                    }
                }
            },
            _ = tokio::time::sleep(DEBOUNCE), if has_pending => {
                write_pending(&storage, &mut pending_draft, &mut pending_history);
            }
        }
    }
}

fn write_pending(
    storage: &PanelStorage,
    pending_draft: &mut Option<String>,
    pending_history: &mut Option<Vec<ChatMessage>>,
) {
    if let Some(text) = pending_draft.take() {
        if let Err(e) = storage.save_draft(&text) {
            tracing::warn!(%e, "failed to save draft");
        }
    }
    if let Some(messages) = pending_history.take() {
        if let Err(e) = storage.save_history(&messages) {
            tracing::warn!(%e, "failed to save history");
        }
    }
}
