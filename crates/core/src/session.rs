use crate::stores::disk::staging_dir_prefix;
use crate::{RagError, Session};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_MARKER_FILE: &str = "session_id.txt";

/// Maps session identifiers to their index directory under a base directory.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    base_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, session_id: &str) -> Result<Session, RagError> {
        validate_session_id(session_id)?;
        Ok(Session {
            id: session_id.to_string(),
            index_path: self.base_dir.join(session_id),
        })
    }

    pub fn new_session(&self) -> Session {
        let id = Uuid::new_v4().to_string();
        Session {
            index_path: self.base_dir.join(&id),
            id,
        }
    }

    pub fn exists(&self, session: &Session) -> bool {
        session.index_path.is_dir()
    }

    /// Deletes the session's index directory along with any first commit
    /// left staged by an interrupted writer. Missing directories are fine.
    pub fn reset(&self, session_id: &str) -> Result<(), RagError> {
        let session = self.resolve(session_id)?;
        self.remove_staging_dirs(&session)?;
        match fs::remove_dir_all(&session.index_path) {
            Ok(()) => {
                info!(session = %session.id, "session index deleted");
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn remove_staging_dirs(&self, session: &Session) -> Result<(), RagError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        let prefix = staging_dir_prefix(&session.id);
        for entry in entries {
            let entry = entry?;
            let is_staging = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
            if !is_staging {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => warn!(path = %entry.path().display(), "removed abandoned staging directory"),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Session ids that currently have a persisted index.
    pub fn list(&self) -> Result<Vec<String>, RagError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_session_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn validate_session_id(session_id: &str) -> Result<(), RagError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(RagError::InvalidArgument("session id is empty".to_string()));
    }
    if trimmed != session_id
        || session_id.starts_with('.')
        || session_id.contains(&['/', '\\'][..])
    {
        return Err(RagError::InvalidArgument(format!(
            "session id {session_id:?} is not a plain directory name"
        )));
    }
    Ok(())
}

pub fn write_marker(path: &Path, session: &Session) -> Result<(), RagError> {
    fs::write(path, &session.id)?;
    Ok(())
}

pub fn read_marker(path: &Path) -> Result<Option<String>, RagError> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let id = contents.trim();
            Ok(if id.is_empty() {
                None
            } else {
                Some(id.to_string())
            })
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}
