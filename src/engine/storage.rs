//! Filesystem layout helpers and slice persistence
//!
//! Manages the .relay/ directory structure, writes session documents
//! atomically via temp files and renames, and defines the [`SliceStore`]
//! seam the session manager persists through.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::EngineConfig;
use super::error::{StorageError, StorageResult};
use super::slice::{SessionId, SessionSlice};

/// Version of the session document format
pub const FORMAT_VERSION: u32 = 1;

/// Persistence collaborator for session slices
pub trait SliceStore: Send + Sync {
    /// Load the stored slice of `id`, if any
    fn load(&self, id: &SessionId) -> StorageResult<Option<SessionSlice>>;

    /// Store `slice`, replacing any previous copy
    fn save(&self, slice: &SessionSlice) -> StorageResult<()>;

    /// Remove the stored copy of `id`
    fn remove(&self, id: &SessionId) -> StorageResult<()>;

    /// Ids of every stored session
    fn list(&self) -> StorageResult<Vec<SessionId>>;

    /// Session that was active when the process last ran
    fn load_active(&self) -> StorageResult<Option<SessionId>>;

    /// Record the active session; `None` clears the marker
    fn save_active(&self, id: Option<&SessionId>) -> StorageResult<()>;
}

/// On-disk envelope of a slice
#[derive(Debug, Serialize, Deserialize)]
struct StoredSlice {
    version: u32,
    saved_at: DateTime<Utc>,
    slice: SessionSlice,
}

#[derive(Deserialize)]
struct StoredHeader {
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActiveMarker {
    session_id: SessionId,
}

fn encode_slice(slice: &SessionSlice) -> StorageResult<Vec<u8>> {
    let doc = StoredSlice {
        version: FORMAT_VERSION,
        saved_at: Utc::now(),
        slice: slice.clone(),
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

fn decode_slice(path: &Path, data: &[u8]) -> StorageResult<SessionSlice> {
    let corrupt = |err: serde_json::Error| StorageError::Corrupt {
        path: path.to_path_buf(),
        detail: err.to_string(),
    };
    let header: StoredHeader = serde_json::from_slice(data).map_err(corrupt)?;
    if header.version != FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: header.version,
            expected: FORMAT_VERSION,
        });
    }
    let doc: StoredSlice = serde_json::from_slice(data).map_err(corrupt)?;
    Ok(doc.slice.into_restored())
}

/// Storage manager for engine persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the sessions directory path
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Get the active-session marker path
    pub fn active_path(&self) -> PathBuf {
        self.root.join("active.json")
    }

    /// Get the document path of a session
    pub fn session_path(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.json", escape_file_name(id.as_str())))
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let failed = |detail: String| StorageError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .map_err(|err| failed(format!("create {}: {err}", temp_path.display())))?;
        file.write_all(data)
            .map_err(|err| failed(format!("write: {err}")))?;
        file.sync_all()
            .map_err(|err| failed(format!("sync: {err}")))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|err| failed(format!("rename {}: {err}", temp_path.display())))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new().read(true).open(parent)?;
            dir.sync_all()?;
        }

        Ok(())
    }

    /// Read a file, `None` when it does not exist
    pub fn read_optional(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a file; a missing file is not an error
    pub fn remove_file(&self, path: &Path) -> StorageResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Escape a session id into a portable file stem.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`.
pub fn escape_file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`escape_file_name`]
pub fn unescape_file_name(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// One JSON document per session under `<root>/sessions/`
#[derive(Debug, Clone)]
pub struct FileSliceStore {
    storage: Storage,
}

impl FileSliceStore {
    /// Store rooted at `root`; the sessions directory is created if missing
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let storage = Storage::new(root.into());
        fs::create_dir_all(storage.sessions_dir())?;
        Ok(Self { storage })
    }

    /// Underlying layout
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl SliceStore for FileSliceStore {
    fn load(&self, id: &SessionId) -> StorageResult<Option<SessionSlice>> {
        let path = self.storage.session_path(id);
        match self.storage.read_optional(&path)? {
            Some(data) => decode_slice(&path, &data).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, slice: &SessionSlice) -> StorageResult<()> {
        let path = self.storage.session_path(&slice.session_id);
        self.storage.write_atomic(&path, &encode_slice(slice)?)
    }

    fn remove(&self, id: &SessionId) -> StorageResult<()> {
        self.storage.remove_file(&self.storage.session_path(id))
    }

    fn list(&self) -> StorageResult<Vec<SessionId>> {
        let dir = self.storage.sessions_dir();
        if !dir.exists() {
            return Err(StorageError::PathNotFound(dir));
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let stem = path.file_stem().and_then(|stem| stem.to_str());
            match stem.and_then(unescape_file_name) {
                Some(id) => ids.push(SessionId(id)),
                None => tracing::warn!(path = %path.display(), "Skipping unrecognised session file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_active(&self) -> StorageResult<Option<SessionId>> {
        let path = self.storage.active_path();
        let Some(data) = self.storage.read_optional(&path)? else {
            return Ok(None);
        };
        let marker: ActiveMarker =
            serde_json::from_slice(&data).map_err(|err| StorageError::Corrupt {
                path,
                detail: err.to_string(),
            })?;
        Ok(Some(marker.session_id))
    }

    fn save_active(&self, id: Option<&SessionId>) -> StorageResult<()> {
        let path = self.storage.active_path();
        match id {
            Some(id) => {
                let marker = ActiveMarker {
                    session_id: id.clone(),
                };
                self.storage
                    .write_atomic(&path, &serde_json::to_vec(&marker)?)
            }
            None => self.storage.remove_file(&path),
        }
    }
}

/// In-process store holding encoded documents
#[derive(Debug, Default)]
pub struct MemorySliceStore {
    docs: Mutex<HashMap<SessionId, Vec<u8>>>,
    active: Mutex<Option<SessionId>>,
}

impl MemorySliceStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes as the document of `id`
    pub fn insert_raw(&self, id: SessionId, data: impl Into<Vec<u8>>) {
        self.docs.lock().insert(id, data.into());
    }

    /// Whether a document for `id` is stored
    pub fn contains(&self, id: &SessionId) -> bool {
        self.docs.lock().contains_key(id)
    }
}

impl SliceStore for MemorySliceStore {
    fn load(&self, id: &SessionId) -> StorageResult<Option<SessionSlice>> {
        let data = self.docs.lock().get(id).cloned();
        match data {
            Some(data) => decode_slice(Path::new(id.as_str()), &data).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, slice: &SessionSlice) -> StorageResult<()> {
        let data = encode_slice(slice)?;
        self.docs.lock().insert(slice.session_id.clone(), data);
        Ok(())
    }

    fn remove(&self, id: &SessionId) -> StorageResult<()> {
        self.docs.lock().remove(id);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.docs.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn load_active(&self) -> StorageResult<Option<SessionId>> {
        Ok(self.active.lock().clone())
    }

    fn save_active(&self, id: Option<&SessionId>) -> StorageResult<()> {
        *self.active.lock() = id.cloned();
        Ok(())
    }
}

/// Initialize storage directories for a new engine
pub fn init_storage(root: &Path) -> anyhow::Result<()> {
    let storage = Storage::new(root.to_path_buf());
    fs::create_dir_all(storage.sessions_dir())
        .with_context(|| format!("Failed to create directory: {:?}", storage.sessions_dir()))?;
    Ok(())
}

/// Write engine configuration
pub fn write_config(config: &EngineConfig) -> anyhow::Result<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage
        .write_atomic(&storage.config_path(), &json)
        .context("Failed to write config")?;
    Ok(())
}

/// Load engine configuration
pub fn load_config(root: &Path) -> anyhow::Result<EngineConfig> {
    let storage = Storage::new(root.to_path_buf());
    let config_path = storage.config_path();
    let data = fs::read(&config_path)
        .with_context(|| format!("Failed to read file: {:?}", config_path))?;
    let config: EngineConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        init_storage(temp.path()).unwrap();
        assert!(temp.path().join("sessions").exists());
    }

    #[test]
    fn test_write_atomic() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        let test_file = temp.path().join("test.txt");
        storage.write_atomic(&test_file, b"test data").unwrap();

        assert_eq!(fs::read(&test_file).unwrap(), b"test data");
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            root: temp.path().to_path_buf(),
            checklist_tool: "PlanWrite".into(),
            ..Default::default()
        };

        write_config(&config).unwrap();
        let loaded = load_config(temp.path()).unwrap();

        assert_eq!(loaded.checklist_tool, "PlanWrite");
        assert_eq!(loaded.root, config.root);
    }

    #[test]
    fn file_names_are_escaped() {
        assert_eq!(escape_file_name("abc-1_2"), "abc-1_2");
        assert_eq!(escape_file_name("../x"), "%2E%2E%2Fx");
        assert_eq!(unescape_file_name("%2E%2E%2Fx").as_deref(), Some("../x"));
        assert_eq!(unescape_file_name("%zz"), None);
    }

    #[test]
    fn file_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileSliceStore::open(temp.path()).unwrap();

        let mut slice = SessionSlice::new(SessionId::new("team/alpha"));
        slice.is_streaming = true;
        slice.agent_session_id = Some("agent-7".into());
        store.save(&slice).unwrap();

        let loaded = store.load(&slice.session_id).unwrap().unwrap();
        assert_eq!(loaded.agent_session_id.as_deref(), Some("agent-7"));
        assert!(!loaded.is_streaming);
        assert_eq!(store.list().unwrap(), vec![SessionId::new("team/alpha")]);

        store.save_active(Some(&slice.session_id)).unwrap();
        assert_eq!(store.load_active().unwrap(), Some(slice.session_id.clone()));

        store.remove(&slice.session_id).unwrap();
        assert!(store.load(&slice.session_id).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_and_future_documents_are_rejected() {
        let store = MemorySliceStore::new();
        let id = SessionId::new("s1");

        store.insert_raw(id.clone(), "{not json");
        assert!(matches!(store.load(&id), Err(StorageError::Corrupt { .. })));

        store.insert_raw(id.clone(), r#"{"version":99,"saved_at":"2024-01-01T00:00:00Z","slice":{}}"#);
        assert!(matches!(
            store.load(&id),
            Err(StorageError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
