//! Transient storage for input APKs staged by a session.
//!
//! Each session stages into `<root>/<session id>/`. The root is cleared when a
//! controller starts and whenever a session resets with no run in flight; a
//! [`ScratchGuard`] releases a run's inputs on every exit path of the run.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!(
                "failed to create scratch directory '{}'",
                self.root.display()
            )
        })
    }

    /// Removes every entry under the root. A missing root counts as clean.
    pub fn clear(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    pub fn clear_session(&self, session_id: Uuid) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(session_id)) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn is_empty(&self) -> bool {
        match fs::read_dir(&self.root) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    /// Copies the selected files into the session's directory and returns the
    /// staged paths in input order. Nothing is left behind on failure.
    pub fn stage(&self, session_id: Uuid, sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).with_context(|| {
            format!("failed to create session scratch '{}'", dir.display())
        })?;

        let staged = sources
            .iter()
            .enumerate()
            .map(|(index, source)| -> Result<PathBuf> {
                let name = source
                    .file_name()
                    .map(|name| name.to_os_string())
                    .unwrap_or_else(|| format!("input-{index}.apk").into());
                let target = dir.join(name);
                fs::copy(source, &target).with_context(|| {
                    format!(
                        "failed to copy '{}' into '{}'",
                        source.display(),
                        dir.display()
                    )
                })?;
                Ok(target)
            })
            .collect::<Result<Vec<_>>>();

        if staged.is_err() {
            if let Err(err) = self.clear_session(session_id) {
                warn!(%session_id, %err, "scratch: failed to remove partially staged inputs");
            }
        }
        staged
    }
}

/// Releases one session's staged inputs when dropped, so cleanup happens
/// whether the run finishes, fails, panics or its task is dropped.
pub struct ScratchGuard {
    scratch: ScratchDir,
    session_id: Uuid,
    released: bool,
}

impl ScratchGuard {
    pub fn new(scratch: ScratchDir, session_id: Uuid) -> Self {
        Self {
            scratch,
            session_id,
            released: false,
        }
    }

    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.scratch.clear_session(self.session_id) {
            Ok(()) => debug!(session_id = %self.session_id, "scratch: released session inputs"),
            Err(err) => warn!(
                session_id = %self.session_id,
                %err,
                "scratch: failed to release session inputs"
            ),
        }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
#[path = "tests/scratch_tests.rs"]
mod tests;
