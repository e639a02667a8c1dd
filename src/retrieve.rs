//! Output Retriever

use std::fs;
use std::io;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::workspace::Workspace;

/// Read the artifact `name` from the workspace.
///
/// A missing file after a successful compiler run is a contract violation
/// and reported as [`PipelineError::OutputMissing`].
pub fn read_output(workspace: &Workspace, name: &str) -> Result<Vec<u8>, PipelineError> {
    let path = workspace.join(name);
    match fs::read(&path) {
        Ok(bytes) => {
            tracing::debug!(path = %path.display(), bytes = bytes.len(), "read artifact");
            Ok(bytes)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PipelineError::OutputMissing(path)),
        Err(e) => Err(PipelineError::OutputRead {
            path,
            source: Arc::new(e),
        }),
    }
}
