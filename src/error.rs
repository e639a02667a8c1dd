//! Pipeline Errors
//!
//! Every stage reports through `PipelineError`. The type is `Clone` so a
//! request can hand its sticky error back to every later call.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::compiler::Compiler;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Could not allocate workspace under {root}: {source}")]
    WorkspaceAllocation {
        root: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Staging error: could not {action} {path}: {source}")]
    Staging {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Could not {compiler} {source_file}: {cause}")]
    CompilerExecution {
        compiler: Compiler,
        source_file: String,
        #[source]
        cause: InvocationFailure,
    },

    #[error("{compiler} did not finish within {timeout:?} and was terminated")]
    CompilerTimeout { compiler: Compiler, timeout: Duration },

    #[error("Compiler reported success but {0} was not produced")]
    OutputMissing(PathBuf),

    #[error("Error reading {path}: {source}")]
    OutputRead {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Could not remove workspace {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Compilation has not been executed yet")]
    NotYetCompiled,

    #[error("Could not write output to {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
}

impl PipelineError {
    pub(crate) fn staging(action: &'static str, path: impl Into<PathBuf>, err: io::Error) -> Self {
        Self::Staging {
            action,
            path: path.into(),
            source: Arc::new(err),
        }
    }

    /// Stable short name of the error kind, used in CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Template(_) => "template",
            Self::WorkspaceAllocation { .. } | Self::Staging { .. } => "staging",
            Self::CompilerExecution { .. } => "compiler_execution",
            Self::CompilerTimeout { .. } => "compiler_timeout",
            Self::OutputMissing(_) => "output_missing",
            Self::OutputRead { .. } => "output_read",
            Self::Cleanup { .. } => "cleanup",
            Self::NotYetCompiled => "not_yet_compiled",
            Self::Save { .. } => "save",
        }
    }
}

/// Why a compiler invocation failed.
#[derive(Debug, Clone)]
pub enum InvocationFailure {
    /// The process could not be started (e.g. executable not found).
    Launch(Arc<io::Error>),
    /// Waiting on the process failed.
    Wait(Arc<io::Error>),
    /// The process ran and exited unsuccessfully.
    Exit {
        code: Option<i32>,
        /// Last lines of the combined compiler output.
        log_tail: String,
    },
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launch(e) => write!(f, "could not launch compiler: {e}"),
            Self::Wait(e) => write!(f, "could not wait for compiler: {e}"),
            Self::Exit { code: Some(code), log_tail } if log_tail.is_empty() => {
                write!(f, "exit status {code}")
            }
            Self::Exit { code: Some(code), log_tail } => {
                write!(f, "exit status {code}\n{log_tail}")
            }
            Self::Exit { code: None, .. } => write!(f, "terminated by signal"),
        }
    }
}

impl std::error::Error for InvocationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Launch(e) | Self::Wait(e) => Some(e.as_ref()),
            Self::Exit { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_message_names_path() {
        let err = PipelineError::staging(
            "write",
            "/tmp/ws/file.tex",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("write"));
        assert!(msg.contains("/tmp/ws/file.tex"));
        assert_eq!(err.kind(), "staging");
    }

    #[test]
    fn test_execution_error_names_compiler() {
        let err = PipelineError::CompilerExecution {
            compiler: Compiler::XeLatex,
            source_file: "file.tex".into(),
            cause: InvocationFailure::Exit {
                code: Some(1),
                log_tail: "! Undefined control sequence.".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Could not xelatex file.tex"));
        assert!(msg.contains("Undefined control sequence"));
    }

    #[test]
    fn test_clone_keeps_source() {
        let err = PipelineError::Cleanup {
            path: "/tmp/ws".into(),
            source: Arc::new(io::Error::new(io::ErrorKind::Other, "busy")),
        };
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(std::error::Error::source(&copy).is_some());
    }
}
