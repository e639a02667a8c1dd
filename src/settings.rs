//! Compile Settings - JSON configuration for requests
//!
//! Every field has a default, so `{}` is a valid settings file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::Compiler;
use crate::error::PipelineError;
use crate::templates::{DEFAULT_TEMPLATES_FOLDER, DEFAULT_TEMPLATE_NAME};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileSettings {
    #[serde(default)]
    pub compiler: Compiler,
    #[serde(default = "default_templates_folder")]
    pub templates_folder: PathBuf,
    #[serde(default = "default_template_name")]
    pub template_name: String,
    #[serde(default)]
    pub copy_files: bool,
    /// Parent directory for workspaces; the OS temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Executable to run instead of the compiler's default program.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Replaces the compiler's default flags when set.
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

fn default_templates_folder() -> PathBuf {
    PathBuf::from(DEFAULT_TEMPLATES_FOLDER)
}

fn default_template_name() -> String {
    DEFAULT_TEMPLATE_NAME.to_string()
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            compiler: Compiler::default(),
            templates_folder: default_templates_folder(),
            template_name: default_template_name(),
            copy_files: false,
            workspace_root: None,
            timeout_secs: None,
            program: None,
            args: None,
        }
    }
}

impl CompileSettings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("could not read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            PipelineError::Configuration(format!("invalid settings {}: {}", path.display(), e))
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
