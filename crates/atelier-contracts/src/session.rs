use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::prompt::ImageSize;

const SESSION_FILE: &str = "session.json";
const SOURCE_FILE: &str = "source.png";
const RESULT_FILE: &str = "result.png";

/// Canonical PNG bytes plus the file-name hint sent alongside uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

impl ImageArtifact {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            file_name: "image.png".to_string(),
        }
    }

    pub fn named(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
        }
    }
}

/// Last-known request parameters, carried across commands so the edit panel
/// can prefill itself after a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionMeta {
    pub last_prompt: String,
    pub last_size: Option<ImageSize>,
    pub last_model: String,
    pub panel_open: bool,
}

/// The workflow state. Valid shapes are enforced by the variant structure:
/// a result can never exist without the source it was edited from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    HasSource {
        source: ImageArtifact,
    },
    HasResult {
        source: ImageArtifact,
        result: ImageArtifact,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub meta: SessionMeta,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Empty,
            meta: SessionMeta::default(),
        }
    }

    pub fn source(&self) -> Option<&ImageArtifact> {
        match &self.state {
            SessionState::Empty => None,
            SessionState::HasSource { source } | SessionState::HasResult { source, .. } => {
                Some(source)
            }
        }
    }

    pub fn result(&self) -> Option<&ImageArtifact> {
        match &self.state {
            SessionState::HasResult { result, .. } => Some(result),
            _ => None,
        }
    }

    /// An edit runs against the source slot and is only offered while no
    /// unpromoted result is pending.
    pub fn can_edit(&self) -> bool {
        matches!(self.state, SessionState::HasSource { .. })
    }

    pub fn can_promote(&self) -> bool {
        matches!(self.state, SessionState::HasResult { .. })
    }

    /// Loads an uploaded image into the source slot. Any pending result is
    /// discarded and the previous prompt/model bookkeeping is cleared.
    pub fn set_source_from_upload(&mut self, artifact: ImageArtifact) {
        self.state = SessionState::HasSource { source: artifact };
        self.meta = SessionMeta {
            panel_open: true,
            ..SessionMeta::default()
        };
    }

    /// Promotes a freshly generated image to the source slot, recording the
    /// prompt, size, and model that produced it.
    pub fn set_source_from_generation(
        &mut self,
        artifact: ImageArtifact,
        prompt: &str,
        size: ImageSize,
        model: &str,
    ) {
        self.state = SessionState::HasSource { source: artifact };
        self.meta = SessionMeta {
            last_prompt: prompt.to_string(),
            last_size: Some(size),
            last_model: model.to_string(),
            panel_open: true,
        };
    }

    /// Stores the outcome of a successful edit call. Result bytes only ever
    /// enter the session through here.
    pub fn accept_edit_result(
        &mut self,
        result: ImageArtifact,
        prompt: &str,
        size: ImageSize,
        model: &str,
    ) -> Result<()> {
        match std::mem::replace(&mut self.state, SessionState::Empty) {
            SessionState::HasSource { source } => {
                self.state = SessionState::HasResult { source, result };
                self.meta.last_prompt = prompt.to_string();
                self.meta.last_size = Some(size);
                self.meta.last_model = model.to_string();
                Ok(())
            }
            SessionState::Empty => bail!("no source image to edit; upload or generate one first"),
            other @ SessionState::HasResult { .. } => {
                self.state = other;
                bail!("an unpromoted result is pending; promote it or reset before editing again")
            }
        }
    }

    /// Moves the result into the source slot so the next edit chains off it.
    pub fn promote_result_to_source(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SessionState::Empty) {
            SessionState::HasResult { result, .. } => {
                self.state = SessionState::HasSource { source: result };
                Ok(())
            }
            other => {
                self.state = other;
                bail!("no result image to promote")
            }
        }
    }

    /// Empties every slot and all bookkeeping, regardless of prior history.
    pub fn clear(&mut self) {
        self.state = SessionState::Empty;
        self.meta = SessionMeta::default();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    id: String,
    state: String,
    meta: SessionMeta,
}

/// On-disk form of one session: `session.json` next to the image slots.
///
/// Image bytes live in their own files so the JSON stays inspectable; a slot
/// whose file is missing or unreadable is treated as absent on load rather
/// than reconstructed half-set.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self) -> Session {
        self.load_validated(|_| true)
    }

    /// Like [`SessionStore::load`], but slot bytes that fail `valid` count as
    /// absent, the same as a missing slot file. Callers that can decode
    /// images pass a decode check here so corrupt bytes never surface as a
    /// present slot.
    pub fn load_validated(&self, valid: impl Fn(&[u8]) -> bool) -> Session {
        let Ok(raw) = std::fs::read_to_string(self.dir.join(SESSION_FILE)) else {
            return Session::new();
        };
        let Ok(file) = serde_json::from_str::<SessionFile>(&raw) else {
            return Session::new();
        };

        let source = std::fs::read(self.dir.join(SOURCE_FILE))
            .ok()
            .filter(|bytes| valid(bytes));
        let result = std::fs::read(self.dir.join(RESULT_FILE))
            .ok()
            .filter(|bytes| valid(bytes));
        let state = match (file.state.as_str(), source, result) {
            ("has_result", Some(source), Some(result)) => SessionState::HasResult {
                source: ImageArtifact::png(source),
                result: ImageArtifact::png(result),
            },
            ("has_result", Some(source), None) | ("has_source", Some(source), _) => {
                SessionState::HasSource {
                    source: ImageArtifact::png(source),
                }
            }
            _ => SessionState::Empty,
        };
        let meta = match state {
            SessionState::Empty => SessionMeta::default(),
            _ => file.meta,
        };
        Session {
            id: file.id,
            state,
            meta,
        }
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let state_tag = match &session.state {
            SessionState::Empty => "empty",
            SessionState::HasSource { .. } => "has_source",
            SessionState::HasResult { .. } => "has_result",
        };
        let file = SessionFile {
            id: session.id.clone(),
            state: state_tag.to_string(),
            meta: session.meta.clone(),
        };
        std::fs::write(
            self.dir.join(SESSION_FILE),
            serde_json::to_string_pretty(&file)?,
        )?;

        self.write_slot(SOURCE_FILE, session.source())?;
        self.write_slot(RESULT_FILE, session.result())?;
        Ok(())
    }

    fn write_slot(&self, name: &str, artifact: Option<&ImageArtifact>) -> Result<()> {
        let path = self.dir.join(name);
        match artifact {
            Some(artifact) => std::fs::write(&path, &artifact.bytes)
                .with_context(|| format!("failed to write {}", path.display()))?,
            None => {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("failed to remove stale {}", path.display()))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(tag: u8) -> ImageArtifact {
        ImageArtifact::png(vec![tag; 8])
    }

    #[test]
    fn edit_is_rejected_while_empty() {
        let mut session = Session::new();
        assert!(!session.can_edit());
        let err = session
            .accept_edit_result(artifact(1), "p", ImageSize::Square, "m")
            .unwrap_err();
        assert!(err.to_string().contains("no source image"));
        assert_eq!(session.state, SessionState::Empty);
    }

    #[test]
    fn upload_sets_the_source_and_clears_any_result() -> Result<()> {
        let mut session = Session::new();
        session.set_source_from_upload(artifact(1));
        session.accept_edit_result(artifact(2), "p", ImageSize::Square, "m")?;
        assert!(session.result().is_some());

        session.set_source_from_upload(artifact(3));
        assert_eq!(session.source(), Some(&artifact(3)));
        assert!(session.result().is_none());
        assert!(session.meta.panel_open);
        assert!(session.meta.last_prompt.is_empty());
        Ok(())
    }

    #[test]
    fn edit_then_promote_round_trip() -> Result<()> {
        let mut session = Session::new();
        session.set_source_from_upload(artifact(1));
        assert!(session.can_edit());
        assert!(!session.can_promote());

        session.accept_edit_result(artifact(2), "make it dusk", ImageSize::Portrait, "gpt-image-1")?;
        assert!(!session.can_edit());
        assert!(session.can_promote());
        assert_eq!(session.meta.last_prompt, "make it dusk");
        assert_eq!(session.meta.last_size, Some(ImageSize::Portrait));

        session.promote_result_to_source()?;
        assert_eq!(session.source(), Some(&artifact(2)));
        assert!(session.result().is_none());
        assert!(session.can_edit());

        // A second promote without an intervening edit has nothing to move.
        assert!(session.promote_result_to_source().is_err());
        assert_eq!(session.source(), Some(&artifact(2)));
        Ok(())
    }

    #[test]
    fn edit_is_rejected_while_a_result_is_pending() -> Result<()> {
        let mut session = Session::new();
        session.set_source_from_upload(artifact(1));
        session.accept_edit_result(artifact(2), "p", ImageSize::Square, "m")?;

        let before = session.clone();
        assert!(session
            .accept_edit_result(artifact(3), "q", ImageSize::Square, "m")
            .is_err());
        assert_eq!(session, before);
        Ok(())
    }

    #[test]
    fn clear_yields_identical_empty_state_from_any_state() -> Result<()> {
        let mut from_empty = Session::new();
        from_empty.clear();

        let mut from_source = Session::new();
        from_source.set_source_from_generation(artifact(1), "p", ImageSize::Auto, "m");
        from_source.clear();

        let mut from_result = Session::new();
        from_result.set_source_from_upload(artifact(1));
        from_result.accept_edit_result(artifact(2), "p", ImageSize::Square, "m")?;
        from_result.clear();

        for session in [&from_empty, &from_source, &from_result] {
            assert_eq!(session.state, SessionState::Empty);
            assert_eq!(session.meta, SessionMeta::default());
        }
        Ok(())
    }

    #[test]
    fn store_round_trips_a_session() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SessionStore::new(temp.path().join("default"));

        let mut session = Session::new();
        session.set_source_from_generation(artifact(1), "a prompt", ImageSize::Square, "gpt-image-1");
        session.accept_edit_result(artifact(2), "an edit", ImageSize::Landscape, "gpt-image-1")?;
        store.save(&session)?;

        let loaded = store.load();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.source(), session.source());
        assert_eq!(loaded.result(), session.result());
        assert_eq!(loaded.meta, session.meta);
        Ok(())
    }

    #[test]
    fn store_load_treats_missing_slot_bytes_as_absent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SessionStore::new(temp.path().join("default"));

        let mut session = Session::new();
        session.set_source_from_upload(artifact(1));
        session.accept_edit_result(artifact(2), "p", ImageSize::Square, "m")?;
        store.save(&session)?;

        std::fs::remove_file(store.dir().join("result.png"))?;
        let loaded = store.load();
        assert!(loaded.can_edit());
        assert!(loaded.result().is_none());

        std::fs::remove_file(store.dir().join("source.png"))?;
        let loaded = store.load();
        assert_eq!(loaded.state, SessionState::Empty);
        Ok(())
    }

    #[test]
    fn load_validated_treats_failing_slot_bytes_as_absent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SessionStore::new(temp.path().join("default"));

        let mut session = Session::new();
        session.set_source_from_upload(artifact(1));
        session.accept_edit_result(artifact(2), "p", ImageSize::Square, "m")?;
        store.save(&session)?;

        // Only the result slot fails validation.
        let loaded = store.load_validated(|bytes| bytes != artifact(2).bytes.as_slice());
        assert!(loaded.can_edit());
        assert!(loaded.result().is_none());

        let loaded = store.load_validated(|_| false);
        assert_eq!(loaded.state, SessionState::Empty);
        assert_eq!(loaded.meta, SessionMeta::default());
        Ok(())
    }

    #[test]
    fn store_save_removes_stale_result_bytes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SessionStore::new(temp.path().join("default"));

        let mut session = Session::new();
        session.set_source_from_upload(artifact(1));
        session.accept_edit_result(artifact(2), "p", ImageSize::Square, "m")?;
        store.save(&session)?;
        assert!(store.dir().join("result.png").exists());

        session.promote_result_to_source()?;
        store.save(&session)?;
        assert!(!store.dir().join("result.png").exists());
        assert_eq!(store.load().source(), Some(&artifact(2)));
        Ok(())
    }

    #[test]
    fn fresh_sessions_get_distinct_ids() {
        assert_ne!(Session::new().id, Session::new().id);
    }
}
