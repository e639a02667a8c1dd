//! Workspace Manager
//!
//! One directory per compilation attempt. Names combine the process id, a
//! process-wide counter and a random v4 UUID, and creation uses
//! `create_dir` (fails if the path exists) with a bounded retry, so two
//! concurrent allocations can never share a directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::PipelineError;

const PREFIX: &str = "texforge";
const MAX_ATTEMPTS: usize = 8;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
thread_local! {
    static REFUSE_REMOVAL: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make workspace removal on the calling thread fail until reset.
#[cfg(test)]
pub(crate) fn refuse_removal_on_this_thread(refuse: bool) {
    REFUSE_REMOVAL.with(|r| r.set(refuse));
}

/// An exclusively-owned, ephemeral directory.
///
/// Call [`Workspace::release`] to remove it and observe failures; if the
/// value is dropped instead (early return, panic) removal is still attempted
/// and failures are logged.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    /// Create a fresh directory under `root`.
    pub fn allocate(root: &Path) -> Result<Self, PipelineError> {
        let root = absolute(root)?;
        let root = root.as_path();
        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            let path = root.join(unique_name());
            match fs::create_dir(&path) {
                Ok(()) => {
                    tracing::debug!(workspace = %path.display(), "allocated workspace");
                    return Ok(Self { path, released: false });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(workspace = %path.display(), "workspace name taken, retrying");
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(PipelineError::WorkspaceAllocation {
                        root: root.to_path_buf(),
                        source: Arc::new(e),
                    })
                }
            }
        }
        Err(PipelineError::WorkspaceAllocation {
            root: root.to_path_buf(),
            source: Arc::new(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AlreadyExists, "no free workspace name")
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `name` inside the workspace.
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Recursively remove the directory.
    pub fn release(mut self) -> Result<(), PipelineError> {
        self.released = true;
        remove(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove(&self.path) {
            tracing::warn!(error = %e, "workspace cleanup failed");
        }
    }
}

fn remove(path: &Path) -> Result<(), PipelineError> {
    match remove_dir_all(path) {
        Ok(()) => {
            tracing::debug!(workspace = %path.display(), "released workspace");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::Cleanup {
            path: path.to_path_buf(),
            source: Arc::new(e),
        }),
    }
}

#[cfg(not(test))]
fn remove_dir_all(path: &Path) -> io::Result<()> {
    fs::remove_dir_all(path)
}

#[cfg(test)]
fn remove_dir_all(path: &Path) -> io::Result<()> {
    if REFUSE_REMOVAL.with(|r| r.get()) {
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "removal refused"));
    }
    fs::remove_dir_all(path)
}

/// Resolve a relative root once, at allocation, so every later path handed
/// to the stager and the compiler is absolute.
fn absolute(root: &Path) -> Result<PathBuf, PipelineError> {
    if root.is_absolute() {
        return Ok(root.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(root))
        .map_err(|e| PipelineError::WorkspaceAllocation {
            root: root.to_path_buf(),
            source: Arc::new(e),
        })
}

fn unique_name() -> String {
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{}-{}",
        PREFIX,
        std::process::id(),
        seq,
        Uuid::new_v4().simple()
    )
}
