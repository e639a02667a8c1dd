//! Input Stager
//!
//! Places the document source, and optionally the template folder's
//! companion files, into a workspace. Copies go through [`TemplateSource`]
//! so bundled templates stage the same way as on-disk ones. A failed copy
//! is not rolled back; the workspace is discarded as a whole.

use std::fs;
use std::path::Path;

use crate::error::PipelineError;
use crate::templates::TemplateSource;
use crate::workspace::Workspace;

/// Fixed name of the staged document source.
pub const SOURCE_FILE_NAME: &str = "file.tex";

/// Write `source` to [`SOURCE_FILE_NAME`] inside the workspace.
pub fn write_source(workspace: &Workspace, source: &str) -> Result<(), PipelineError> {
    let path = workspace.join(SOURCE_FILE_NAME);
    fs::write(&path, source).map_err(|e| PipelineError::staging("write", &path, e))?;
    tracing::debug!(path = %path.display(), bytes = source.len(), "staged source");
    Ok(())
}

/// Copy every entry of `folder` (recursively) into the workspace root.
///
/// Returns the number of files copied.
pub fn copy_auxiliary(
    source: &dyn TemplateSource,
    folder: &Path,
    workspace: &Workspace,
) -> Result<usize, PipelineError> {
    let copied = copy_dir(source, folder, workspace.path())?;
    tracing::debug!(folder = %folder.display(), files = copied, "copied auxiliary files");
    Ok(copied)
}

fn copy_dir(source: &dyn TemplateSource, from: &Path, to: &Path) -> Result<usize, PipelineError> {
    let entries = source
        .list(from)
        .map_err(|e| PipelineError::staging("list", from, e))?;

    let mut copied = 0;
    for entry in entries {
        let src = from.join(&entry.name);
        let dst = to.join(&entry.name);
        if entry.is_dir {
            fs::create_dir_all(&dst).map_err(|e| PipelineError::staging("create", &dst, e))?;
            copied += copy_dir(source, &src, &dst)?;
            continue;
        }
        let bytes = source
            .read(&src)
            .map_err(|e| PipelineError::staging("read", &src, e))?;
        fs::write(&dst, bytes).map_err(|e| PipelineError::staging("copy to", &dst, e))?;
        copied += 1;
    }
    Ok(copied)
}
