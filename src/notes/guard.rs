use super::{ NoteRecord, NoteStore, NoteStoreError };
use crate::models::chat::ChatContext;
use crate::stream::action::ActionPayload;
use log::{ debug, info, warn };
use std::collections::{ HashSet, VecDeque };
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteAction {
    Create,
    Edit,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseNoteActionError {
    action: String,
}

impl fmt::Display for ParseNoteActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a note action", self.action)
    }
}

impl std::error::Error for ParseNoteActionError {}

impl FromStr for NoteAction {
    type Err = ParseNoteActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(NoteAction::Create),
            "edit" => Ok(NoteAction::Edit),
            _ => Err(ParseNoteActionError { action: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// `chat` or anything else outside the create/edit vocabulary.
    NotANoteAction(String),
    EditsDisabled,
    EmptyContent,
    NoActiveNote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(NoteRecord),
    AlreadyApplied,
    Skipped(SkipReason),
}

pub const DEFAULT_LATCH_CAPACITY: usize = 10_000;

/// Message ids already acted on, oldest first out once `capacity` is hit.
#[derive(Debug)]
struct Latch {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Latch {
    fn new(capacity: usize) -> Self {
        Self { ids: HashSet::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|o| o != id);
        }
    }
}

/// Applies recovered actions to a note store at most once per message id.
///
/// The latch lives in memory for the lifetime of the guard and remembers the
/// most recent `capacity` message ids. A redelivery of an evicted id would be
/// applied again.
pub struct ActionGuard {
    store: Arc<dyn NoteStore>,
    applied: Mutex<Latch>,
}

impl ActionGuard {
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self::with_capacity(store, DEFAULT_LATCH_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn NoteStore>, capacity: usize) -> Self {
        Self {
            store,
            applied: Mutex::new(Latch::new(capacity)),
        }
    }

    pub async fn is_applied(&self, message_id: &str) -> bool {
        self.applied.lock().await.ids.contains(message_id)
    }

    pub async fn apply(
        &self,
        message_id: &str,
        payload: &ActionPayload,
        context: &ChatContext
    ) -> Result<ApplyOutcome, NoteStoreError> {
        let action = match payload.action.parse::<NoteAction>() {
            Ok(action) => action,
            Err(_) => {
                return Ok(ApplyOutcome::Skipped(SkipReason::NotANoteAction(payload.action.clone())));
            }
        };
        if !context.allow_edits {
            debug!("Action {:?} suppressed: edits are disabled", action);
            return Ok(ApplyOutcome::Skipped(SkipReason::EditsDisabled));
        }
        let content = match payload.content.as_deref() {
            Some(c) if !c.trim().is_empty() => c,
            _ => {
                return Ok(ApplyOutcome::Skipped(SkipReason::EmptyContent));
            }
        };
        let active_note = context.active_note_id.as_deref();
        if action == NoteAction::Edit && active_note.is_none() {
            warn!("Edit action for message {} but no active note; skipping write", message_id);
            return Ok(ApplyOutcome::Skipped(SkipReason::NoActiveNote));
        }

        // Latch before the write so a concurrent redelivery sees it.
        if !self.applied.lock().await.insert(message_id) {
            debug!("Action for message {} already applied", message_id);
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let result = match (action, active_note) {
            (NoteAction::Edit, Some(note_id)) => self.store.append_to_note(note_id, content).await,
            _ => {
                let title = create_title(payload.filename.as_deref());
                self.store.create_note(&title, content).await
            }
        };

        match result {
            Ok(record) => {
                info!(
                    "Applied {:?} for message {} to note {} ({} chars)",
                    action,
                    message_id,
                    record.id,
                    content.chars().count()
                );
                Ok(ApplyOutcome::Applied(record))
            }
            Err(e) => {
                self.applied.lock().await.remove(message_id);
                Err(e)
            }
        }
    }
}

fn create_title(filename: Option<&str>) -> String {
    let stem = filename.map(|f| f.trim().trim_end_matches(".md").trim()).unwrap_or("");
    if stem.is_empty() { "Untitled".to_string() } else { stem.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::MemoryNoteStore;

    fn payload(action: &str, content: Option<&str>, filename: Option<&str>) -> ActionPayload {
        ActionPayload {
            action: action.to_string(),
            message: "done".to_string(),
            content: content.map(str::to_string),
            filename: filename.map(str::to_string),
        }
    }

    fn edits_allowed(active: Option<&str>) -> ChatContext {
        ChatContext {
            allow_edits: true,
            active_note_id: active.map(str::to_string),
            ..ChatContext::default()
        }
    }

    #[tokio::test]
    async fn applies_once_per_message() {
        let store = Arc::new(MemoryNoteStore::new());
        let guard = ActionGuard::new(store.clone());
        let p = payload("create", Some("body"), Some("attention.md"));
        let ctx = edits_allowed(None);

        let first = guard.apply("m1", &p, &ctx).await.unwrap();
        match first {
            ApplyOutcome::Applied(record) => assert_eq!(record.title, "attention"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(guard.apply("m1", &p, &ctx).await.unwrap(), ApplyOutcome::AlreadyApplied);
        assert_eq!(store.len().await, 1);
        assert!(guard.is_applied("m1").await);

        assert!(matches!(guard.apply("m2", &p, &ctx).await.unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn edit_appends_to_active_note() {
        let store = Arc::new(MemoryNoteStore::new());
        store.insert("note-1", "# Notes").await;
        let guard = ActionGuard::new(store.clone());
        let outcome = guard
            .apply("m1", &payload("edit", Some("$\\beta$"), None), &edits_allowed(Some("note-1"))).await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(ref r) if r.id == "note-1"));
        assert_eq!(store.get("note-1").await.unwrap(), "# Notes\n\n$\\beta$");
    }

    #[tokio::test]
    async fn skips_without_side_effects() {
        let store = Arc::new(MemoryNoteStore::new());
        let guard = ActionGuard::new(store.clone());

        let chat = guard.apply("m1", &payload("chat", None, None), &edits_allowed(None)).await.unwrap();
        assert_eq!(chat, ApplyOutcome::Skipped(SkipReason::NotANoteAction("chat".into())));

        let disabled = guard
            .apply("m2", &payload("create", Some("x"), None), &ChatContext::default()).await
            .unwrap();
        assert_eq!(disabled, ApplyOutcome::Skipped(SkipReason::EditsDisabled));

        let empty = guard.apply("m3", &payload("create", Some("  "), None), &edits_allowed(None)).await.unwrap();
        assert_eq!(empty, ApplyOutcome::Skipped(SkipReason::EmptyContent));

        let no_note = guard.apply("m4", &payload("edit", Some("x"), None), &edits_allowed(None)).await.unwrap();
        assert_eq!(no_note, ApplyOutcome::Skipped(SkipReason::NoActiveNote));

        assert_eq!(store.len().await, 0);
        assert!(!guard.is_applied("m2").await);
    }

    #[tokio::test]
    async fn failed_write_releases_latch() {
        let store = Arc::new(MemoryNoteStore::new());
        let guard = ActionGuard::new(store.clone());
        let p = payload("edit", Some("x"), None);
        let ctx = edits_allowed(Some("missing"));
        assert!(guard.apply("m1", &p, &ctx).await.is_err());
        assert!(!guard.is_applied("m1").await);
    }

    #[tokio::test]
    async fn latch_forgets_oldest_ids_past_capacity() {
        let store = Arc::new(MemoryNoteStore::new());
        let guard = ActionGuard::with_capacity(store.clone(), 2);
        let p = payload("create", Some("body"), None);
        let ctx = edits_allowed(None);
        for id in ["m1", "m2", "m3"] {
            assert!(matches!(guard.apply(id, &p, &ctx).await.unwrap(), ApplyOutcome::Applied(_)));
        }
        assert!(!guard.is_applied("m1").await);
        assert!(guard.is_applied("m2").await);
        assert!(guard.is_applied("m3").await);
        assert_eq!(guard.apply("m3", &p, &ctx).await.unwrap(), ApplyOutcome::AlreadyApplied);
        assert_eq!(store.len().await, 3);
    }

    #[test]
    fn parses_action_names() {
        assert_eq!("Create".parse::<NoteAction>(), Ok(NoteAction::Create));
        assert_eq!(" edit ".parse::<NoteAction>(), Ok(NoteAction::Edit));
        assert!("chat".parse::<NoteAction>().is_err());
        assert_eq!(create_title(Some("notes.md")), "notes");
        assert_eq!(create_title(None), "Untitled");
    }
}
