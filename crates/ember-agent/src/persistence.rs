//! Session persistence: save, backup, load, restore and clear.
//!
//! Callers treat every failure here as non-fatal; the agent logs and moves on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ember_ai::Message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::conversation::DisplayEntry;

/// Everything needed to resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub display: Vec<DisplayEntry>,
    pub model: String,
    pub cwd: PathBuf,
    pub saved_at: i64,
}

impl SessionSnapshot {
    pub fn new(
        messages: Vec<Message>,
        display: Vec<DisplayEntry>,
        model: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            messages,
            display,
            model: model.into(),
            cwd: cwd.into(),
            saved_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Storage for the current session and a single backup slot.
pub trait SessionStore: Send + Sync {
    /// Overwrite the current session.
    fn save(&self, snapshot: &SessionSnapshot) -> io::Result<()>;
    /// Overwrite the backup slot.
    fn backup(&self, snapshot: &SessionSnapshot) -> io::Result<()>;
    /// Read the current session.
    fn load(&self) -> io::Result<Option<SessionSnapshot>>;
    /// Read the backup slot. The backup stays in place until the next `backup`.
    fn restore_backup(&self) -> io::Result<Option<SessionSnapshot>>;
    /// Forget the current session. The backup slot is left alone so it can still be restored.
    fn clear(&self) -> io::Result<()>;
}

const SESSION_FILE: &str = "session.json";
const BACKUP_FILE: &str = "session.backup.json";

/// JSON files in a per-project directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory for all sessions
    pub fn sessions_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ember")
            .join("sessions")
    }

    /// Store keyed by project directory, so each checkout resumes its own session.
    pub fn for_working_dir(cwd: &Path) -> Self {
        Self::new(Self::sessions_dir().join(slug(cwd)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, name: &str, snapshot: &SessionSnapshot) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(tmp, self.dir.join(name))
    }

    fn read(&self, name: &str) -> io::Result<Option<SessionSnapshot>> {
        let path = self.dir.join(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn slug(path: &Path) -> String {
    let s: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let s = s.trim_matches('-');
    if s.is_empty() { "root".to_string() } else { s.to_string() }
}

impl SessionStore for FileStore {
    fn save(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        self.write(SESSION_FILE, snapshot)
    }

    fn backup(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        self.write(BACKUP_FILE, snapshot)
    }

    fn load(&self) -> io::Result<Option<SessionSnapshot>> {
        self.read(SESSION_FILE)
    }

    fn restore_backup(&self) -> io::Result<Option<SessionSnapshot>> {
        self.read(BACKUP_FILE)
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(self.dir.join(SESSION_FILE)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-process store, for `--no-persist` runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    session: Mutex<Option<SessionSnapshot>>,
    backup: Mutex<Option<SessionSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        *self.session.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn backup(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        *self.backup.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<SessionSnapshot>> {
        Ok(self.session.lock().clone())
    }

    fn restore_backup(&self) -> io::Result<Option<SessionSnapshot>> {
        Ok(self.backup.lock().clone())
    }

    fn clear(&self) -> io::Result<()> {
        *self.session.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::DisplayKind;

    fn snapshot(text: &str) -> SessionSnapshot {
        SessionSnapshot::new(
            vec![Message::user(text), Message::assistant("ok")],
            vec![DisplayEntry::new(DisplayKind::User, text)],
            "test-model",
            "/tmp/project",
        )
    }

    #[test]
    fn test_file_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("s"));
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot("first")).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.messages[0].text(), "first");
        assert_eq!(loaded.model, "test-model");
        assert_eq!(loaded.display.len(), 1);
    }

    #[test]
    fn test_file_store_backup_survives_until_next_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.restore_backup().unwrap().is_none());

        store.backup(&snapshot("one")).unwrap();
        assert_eq!(store.restore_backup().unwrap().unwrap().messages[0].text(), "one");
        // reading does not consume
        assert_eq!(store.restore_backup().unwrap().unwrap().messages[0].text(), "one");

        store.backup(&snapshot("two")).unwrap();
        assert_eq!(store.restore_backup().unwrap().unwrap().messages[0].text(), "two");
    }

    #[test]
    fn test_file_store_clear_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.clear().unwrap();

        store.save(&snapshot("current")).unwrap();
        store.backup(&snapshot("saved")).unwrap();
        store.clear().unwrap();

        assert!(store.load().unwrap().is_none());
        assert!(store.restore_backup().unwrap().is_some());
    }

    #[test]
    fn test_file_store_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SESSION_FILE), b"{not json").unwrap();
        let store = FileStore::new(dir.path());
        assert_eq!(
            store.load().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug(Path::new("/home/me/my project")), "home-me-my-project");
        assert_eq!(slug(Path::new("/")), "root");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&snapshot("a")).unwrap();
        store.backup(&snapshot("b")).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.restore_backup().unwrap().unwrap().messages[0].text(), "b");
    }
}
