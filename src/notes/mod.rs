pub mod guard;

use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{ Path, PathBuf };
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use guard::{ ActionGuard, ApplyOutcome, NoteAction, SkipReason };

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteRecord {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NoteStoreError {
    #[error("note '{0}' not found")]
    NotFound(String),
    #[error("invalid note id '{0}'")]
    InvalidId(String),
    #[error("note store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where create/edit actions land.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn create_note(&self, title: &str, content: &str) -> Result<NoteRecord, NoteStoreError>;

    async fn append_to_note(
        &self,
        note_id: &str,
        content: &str
    ) -> Result<NoteRecord, NoteStoreError>;
}

fn new_note_body(title: &str, content: &str) -> String {
    let mut body = format!("# {}\n\n", title);
    body.push_str(content);
    body
}

fn append_body(existing: &str, content: &str) -> String {
    format!("{}\n\n{}", existing.trim_end(), content)
}

/// First `# ` heading, else the fallback.
pub fn extract_title(content: &str, fallback: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# ").map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| if fallback.is_empty() { "Untitled".to_string() } else { fallback.to_string() })
}

#[derive(Debug, Default)]
pub struct MemoryNoteStore {
    notes: Mutex<HashMap<String, String>>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, note_id: &str, body: &str) {
        self.notes.lock().await.insert(note_id.to_string(), body.to_string());
    }

    pub async fn get(&self, note_id: &str) -> Option<String> {
        self.notes.lock().await.get(note_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.notes.lock().await.len()
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn create_note(&self, title: &str, content: &str) -> Result<NoteRecord, NoteStoreError> {
        let id = Uuid::new_v4().to_string();
        self.notes.lock().await.insert(id.clone(), new_note_body(title, content));
        Ok(NoteRecord { id, title: title.to_string(), updated_at: Utc::now() })
    }

    async fn append_to_note(
        &self,
        note_id: &str,
        content: &str
    ) -> Result<NoteRecord, NoteStoreError> {
        let mut notes = self.notes.lock().await;
        let body = notes.get_mut(note_id).ok_or_else(|| NoteStoreError::NotFound(note_id.to_string()))?;
        *body = append_body(body, content);
        Ok(NoteRecord {
            id: note_id.to_string(),
            title: extract_title(body, note_id),
            updated_at: Utc::now(),
        })
    }
}

/// Markdown files named `<id>.md` in one directory.
#[derive(Debug, Clone)]
pub struct DirNoteStore {
    dir: PathBuf,
}

impl DirNoteStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, NoteStoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        info!("Notes will be stored in: {}", dir.display());
        Ok(Self { dir })
    }

    fn note_path(&self, note_id: &str) -> Result<PathBuf, NoteStoreError> {
        let valid = !note_id.is_empty() &&
            note_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(NoteStoreError::InvalidId(note_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.md", note_id)))
    }

    pub async fn read_note(&self, note_id: &str) -> Result<String, NoteStoreError> {
        let path = self.note_path(note_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NoteStoreError::NotFound(note_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NoteStore for DirNoteStore {
    async fn create_note(&self, title: &str, content: &str) -> Result<NoteRecord, NoteStoreError> {
        let id = Uuid::new_v4().to_string();
        let path = self.note_path(&id)?;
        tokio::fs::write(&path, new_note_body(title, content)).await?;
        info!("Created note {}: {}", id, title);
        Ok(NoteRecord { id, title: title.to_string(), updated_at: Utc::now() })
    }

    async fn append_to_note(
        &self,
        note_id: &str,
        content: &str
    ) -> Result<NoteRecord, NoteStoreError> {
        let path = self.note_path(note_id)?;
        let existing = self.read_note(note_id).await?;
        let updated = append_body(&existing, content);
        tokio::fs::write(&path, &updated).await?;
        info!("Appended to note {} ({} chars)", note_id, content.chars().count());
        Ok(NoteRecord {
            id: note_id.to_string(),
            title: extract_title(&updated, note_id),
            updated_at: Utc::now(),
        })
    }
}
