//! Compilation Pipeline - Fluent Request Builder
//!
//! A `CompilationRequest` collects options, then `compile` runs
//! render -> stage -> invoke -> retrieve -> release in a fresh workspace.
//!
//! The first error is sticky: once recorded, every builder call passes the
//! request through untouched and `compile`/`save` return that error.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tera::Tera;
use uuid::Uuid;

use crate::compiler::{Compiler, Invocation};
use crate::error::PipelineError;
use crate::hashing::{canonical_json, compute_job_hash, sha256_hex};
use crate::retrieve;
use crate::settings::CompileSettings;
use crate::stage::{self, SOURCE_FILE_NAME};
use crate::templates::{self, DiskSource, RenderFunctions, TemplateSource};
use crate::workspace::Workspace;
use crate::ENGINE_VERSION;

/// Summary of one successful compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationReport {
    pub id: String,
    pub compiler: Compiler,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub size_bytes: usize,
    pub source_hash: String,
    pub output_hash: String,
    #[serde(default)]
    pub data_hash: Option<String>,
    pub job_hash: String,
}

/// One compilation attempt's configuration and result.
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    compiler: Compiler,
    templates_folder: PathBuf,
    template_name: String,
    source: Arc<dyn TemplateSource>,
    functions: RenderFunctions,
    data: Option<Value>,
    template: Option<Tera>,
    template_injected: bool,
    copy_files: bool,
    input: String,
    workspace_root: Option<PathBuf>,
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    timeout: Option<Duration>,

    error: Option<PipelineError>,
    output: Option<Vec<u8>>,
    report: Option<CompilationReport>,
    cleanup_error: Option<PipelineError>,
    last_workspace: Option<PathBuf>,
}

impl Default for CompilationRequest {
    fn default() -> Self {
        Self::from_settings(&CompileSettings::default())
    }
}

impl CompilationRequest {
    /// `pdflatex`, folder `templates`, template `template.tmpl`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &CompileSettings) -> Self {
        Self {
            compiler: settings.compiler,
            templates_folder: settings.templates_folder.clone(),
            template_name: settings.template_name.clone(),
            source: Arc::new(DiskSource),
            functions: RenderFunctions::new(),
            data: None,
            template: None,
            template_injected: false,
            copy_files: settings.copy_files,
            input: String::new(),
            workspace_root: settings.workspace_root.clone(),
            program: settings.program.clone(),
            args: settings.args.clone(),
            timeout: settings.timeout(),
            error: None,
            output: None,
            report: None,
            cleanup_error: None,
            last_workspace: None,
        }
    }

    fn update(mut self, apply: impl FnOnce(&mut Self)) -> Self {
        if self.error.is_none() {
            apply(&mut self);
        }
        self
    }

    /// Drop a template loaded by an earlier compile; injected ones stay.
    fn forget_loaded_template(&mut self) {
        if !self.template_injected {
            self.template = None;
        }
    }

    pub fn with_compiler(self, compiler: Compiler) -> Self {
        self.update(|r| r.compiler = compiler)
    }

    pub fn with_templates_folder(self, folder: impl Into<PathBuf>) -> Self {
        let folder = folder.into();
        self.update(|r| {
            r.templates_folder = folder;
            r.forget_loaded_template();
        })
    }

    pub fn with_template_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.update(|r| {
            r.template_name = name;
            r.forget_loaded_template();
        })
    }

    /// Read templates and auxiliary files from `source` instead of disk.
    pub fn with_file_system(self, source: impl TemplateSource + 'static) -> Self {
        self.update(|r| {
            r.source = Arc::new(source);
            r.forget_loaded_template();
        })
    }

    pub fn with_render_functions(self, functions: RenderFunctions) -> Self {
        self.update(|r| {
            r.functions = functions;
            r.forget_loaded_template();
        })
    }

    /// Set the template payload. A value that cannot be represented as JSON
    /// records a configuration error.
    pub fn with_data<T: Serialize + ?Sized>(self, data: &T) -> Self {
        let value = serde_json::to_value(data);
        self.update(|r| match value {
            Ok(value) => r.data = Some(value),
            Err(e) => {
                r.error = Some(PipelineError::Configuration(format!(
                    "data payload is not serializable: {e}"
                )))
            }
        })
    }

    /// Use a pre-built engine; `template_name` selects the entry point.
    pub fn with_template(self, template: Tera) -> Self {
        self.update(|r| {
            r.template = Some(template);
            r.template_injected = true;
        })
    }

    /// Copy the templates folder's contents into the workspace before compiling.
    pub fn with_copy_files(self) -> Self {
        self.update(|r| r.copy_files = true)
    }

    /// Compile `input` verbatim, skipping the template renderer.
    pub fn with_raw_input(self, input: impl Into<String>) -> Self {
        let input = input.into();
        self.update(|r| r.input = input)
    }

    /// Parent directory for workspaces (defaults to the OS temp dir).
    pub fn with_workspace_root(self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.update(|r| r.workspace_root = Some(root))
    }

    /// Kill the compiler if it runs longer than `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.update(|r| r.timeout = Some(timeout))
    }

    /// Run this executable instead of the compiler's default program.
    pub fn with_compiler_program(self, program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        self.update(|r| r.program = Some(program))
    }

    /// Replace the default compiler flags. The source file name is always
    /// appended last.
    pub fn with_compiler_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.update(|r| r.args = Some(args))
    }

    pub fn last_error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    pub fn report(&self) -> Option<&CompilationReport> {
        self.report.as_ref()
    }

    /// Workspace removal failure from the last compile, if any. Does not
    /// invalidate a successful compile.
    pub fn cleanup_error(&self) -> Option<&PipelineError> {
        self.cleanup_error.as_ref()
    }

    /// Directory used by the last compile (already removed).
    pub fn last_workspace(&self) -> Option<&Path> {
        self.last_workspace.as_deref()
    }

    /// Run the whole pipeline with the current configuration.
    ///
    /// Calling it again re-runs everything and replaces the previous output.
    pub fn compile(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        let span = tracing::info_span!("compile", compiler = %self.compiler);
        let _enter = span.enter();

        self.output = None;
        self.report = None;
        self.cleanup_error = None;

        let started = Instant::now();
        match self.execute() {
            Ok((source, output)) => {
                let report = self.build_report(&source, &output, started.elapsed());
                tracing::info!(
                    duration_ms = report.duration_ms,
                    bytes = report.size_bytes,
                    "compiled document"
                );
                self.report = Some(report);
                self.output = Some(output);
            }
            Err(e) => {
                tracing::debug!(error = %e, "compilation failed");
                self.error = Some(e);
            }
        }
        self
    }

    /// Write the compiled bytes to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        let output = self.ready_output()?;
        std::fs::write(path, output).map_err(|e| PipelineError::Save {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })
    }

    /// Take the compiled bytes.
    pub fn into_output(self) -> Result<Vec<u8>, PipelineError> {
        self.ready_output()?;
        self.output.ok_or(PipelineError::NotYetCompiled)
    }

    fn ready_output(&self) -> Result<&[u8], PipelineError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        self.output.as_deref().ok_or(PipelineError::NotYetCompiled)
    }

    fn execute(&mut self) -> Result<(String, Vec<u8>), PipelineError> {
        let source = self.document_source()?;

        let root = self
            .workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let workspace = Workspace::allocate(&root)?;
        self.last_workspace = Some(workspace.path().to_path_buf());

        let result = self.run_in(&workspace, &source);
        let cleanup = workspace.release();

        match (result, cleanup) {
            (Ok(output), Ok(())) => Ok((source, output)),
            (Ok(output), Err(cleanup)) => {
                tracing::warn!(error = %cleanup, "compiled, but workspace cleanup failed");
                self.cleanup_error = Some(cleanup);
                Ok((source, output))
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                tracing::warn!(error = %cleanup, cause = %e, "workspace cleanup failed after error");
                self.cleanup_error = Some(cleanup);
                Err(e)
            }
        }
    }

    fn run_in(&self, workspace: &Workspace, source: &str) -> Result<Vec<u8>, PipelineError> {
        // Companion files first, so a stray file.tex in the folder never
        // replaces the document being compiled.
        if self.copy_files {
            stage::copy_auxiliary(self.source.as_ref(), &self.templates_folder, workspace)?;
        }
        stage::write_source(workspace, source)?;

        self.invocation().run(workspace.path(), SOURCE_FILE_NAME)?;

        retrieve::read_output(workspace, &self.compiler.output_name(SOURCE_FILE_NAME))
    }

    fn invocation(&self) -> Invocation {
        let mut invocation = Invocation::new(self.compiler);
        invocation.program = self.program.clone();
        if let Some(args) = &self.args {
            invocation.args = args.clone();
        }
        invocation.timeout = self.timeout;
        invocation
    }

    fn document_source(&mut self) -> Result<String, PipelineError> {
        if !self.input.is_empty() {
            if self.template_injected || self.data.is_some() || !self.functions.is_empty() {
                return Err(PipelineError::Configuration(
                    "raw input cannot be combined with a template, data or render functions"
                        .into(),
                ));
            }
            if self.ignores_template_settings() {
                tracing::warn!(
                    folder = %self.templates_folder.display(),
                    template = %self.template_name,
                    "raw input given; templates folder and name are unused without copy_files"
                );
            }
            return Ok(self.input.clone());
        }

        let tera = match self.template.take() {
            Some(tera) => tera,
            None => templates::load(
                self.source.as_ref(),
                &self.templates_folder,
                &self.template_name,
            )?,
        };
        let tera = self.template.insert(tera);
        let data = self.data.as_ref().unwrap_or(&Value::Null);
        templates::render(tera, &self.template_name, data, &self.functions)
    }

    /// A folder or template name was set that raw input will never read.
    fn ignores_template_settings(&self) -> bool {
        !self.copy_files
            && (self.templates_folder != Path::new(templates::DEFAULT_TEMPLATES_FOLDER)
                || self.template_name != templates::DEFAULT_TEMPLATE_NAME)
    }

    fn build_report(&self, source: &str, output: &[u8], elapsed: Duration) -> CompilationReport {
        let source_hash = sha256_hex(source.as_bytes());
        CompilationReport {
            id: Uuid::new_v4().to_string(),
            compiler: self.compiler,
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            size_bytes: output.len(),
            job_hash: compute_job_hash(self.compiler, &source_hash, ENGINE_VERSION),
            source_hash,
            output_hash: sha256_hex(output),
            data_hash: self
                .data
                .as_ref()
                .and_then(|d| canonical_json(d).ok())
                .map(|c| sha256_hex(c.as_bytes())),
        }
    }
}

/// Compile a template folder: copy its files, render `template` with
/// `data`, and return the artifact as a reader.
///
/// `template` must contain an entry named `template.tmpl`.
pub fn compile_folder<T: Serialize + ?Sized>(
    folder: impl AsRef<Path>,
    template: Tera,
    data: &T,
) -> Result<Cursor<Vec<u8>>, PipelineError> {
    compile_folder_with(CompilationRequest::new(), folder, template, data)
}

/// [`compile_folder`] starting from a configured request (compiler,
/// timeout, template name, ...).
pub fn compile_folder_with<T: Serialize + ?Sized>(
    base: CompilationRequest,
    folder: impl AsRef<Path>,
    template: Tera,
    data: &T,
) -> Result<Cursor<Vec<u8>>, PipelineError> {
    base.with_templates_folder(folder.as_ref())
        .with_template(template)
        .with_data(data)
        .with_copy_files()
        .compile()
        .into_output()
        .map(Cursor::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::EmbeddedSource;
    use crate::workspace::refuse_removal_on_this_thread;
    use serde::ser::Error as _;
    use std::collections::HashMap;

    #[cfg(unix)]
    fn fake_compiler(root: &Path, script: &str) -> CompilationRequest {
        CompilationRequest::new()
            .with_workspace_root(root)
            .with_compiler_program("sh")
            .with_compiler_args(["-c", script, "fake-latex"])
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refused"))
        }
    }

    #[test]
    fn test_defaults() {
        let req = CompilationRequest::new();
        assert_eq!(req.compiler, Compiler::PdfLatex);
        assert_eq!(req.templates_folder, PathBuf::from("templates"));
        assert_eq!(req.template_name, "template.tmpl");
        assert!(!req.copy_files);
        assert!(req.last_error().is_none());
        assert!(req.output().is_none());
    }

    #[test]
    fn test_save_before_compile() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.pdf");
        let err = CompilationRequest::new().save(&target).unwrap_err();
        assert!(matches!(err, PipelineError::NotYetCompiled));
        assert!(!target.exists());
    }

    #[test]
    fn test_error_is_sticky_across_setters() {
        let req = CompilationRequest::new()
            .with_data(&Unserializable)
            .with_compiler(Compiler::XeLatex)
            .with_template_name("other.tmpl")
            .with_raw_input("ignored");

        assert!(matches!(req.last_error(), Some(PipelineError::Configuration(_))));
        assert_eq!(req.compiler, Compiler::PdfLatex);
        assert_eq!(req.template_name, "template.tmpl");
        assert!(req.input.is_empty());
    }

    #[test]
    fn test_compile_after_error_does_no_io() {
        let root = tempfile::tempdir().unwrap();
        let req = CompilationRequest::new()
            .with_workspace_root(root.path())
            .with_data(&Unserializable)
            .compile();

        assert!(req.last_workspace().is_none());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);

        let first = req.last_error().unwrap().to_string();
        let target = root.path().join("out.pdf");
        let err = req.save(&target).unwrap_err();
        assert_eq!(err.to_string(), first);
        assert!(!target.exists());
    }

    #[test]
    fn test_raw_input_conflicts_with_data() {
        let root = tempfile::tempdir().unwrap();
        let req = CompilationRequest::new()
            .with_workspace_root(root.path())
            .with_data(&["a", "b"])
            .with_raw_input("\\relax")
            .compile();
        assert!(matches!(req.last_error(), Some(PipelineError::Configuration(_))));
        assert!(req.last_workspace().is_none());
    }

    #[test]
    fn test_template_error_stops_before_workspace() {
        let root = tempfile::tempdir().unwrap();
        let source = EmbeddedSource::new().with_file("templates/template.tmpl", "{{ missing }}");
        let req = CompilationRequest::new()
            .with_workspace_root(root.path())
            .with_file_system(source)
            .compile();

        assert!(matches!(req.last_error(), Some(PipelineError::Template(_))));
        assert!(req.last_workspace().is_none());
        assert!(matches!(req.into_output(), Err(PipelineError::Template(_))));
    }

    #[test]
    fn test_from_settings() {
        let settings = CompileSettings {
            compiler: Compiler::XeLatex,
            copy_files: true,
            timeout_secs: Some(5),
            args: Some(vec!["-shell-escape".into()]),
            ..CompileSettings::default()
        };
        let req = CompilationRequest::from_settings(&settings);
        let inv = req.invocation();
        assert_eq!(inv.compiler, Compiler::XeLatex);
        assert_eq!(inv.args, vec!["-shell-escape".to_string()]);
        assert_eq!(inv.timeout, Some(Duration::from_secs(5)));
        assert!(req.copy_files);
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_failure_after_success_is_separate() {
        let root = tempfile::tempdir().unwrap();
        refuse_removal_on_this_thread(true);
        let req = fake_compiler(root.path(), r#"cat "$1" > "${1%.tex}.pdf""#)
            .with_raw_input("\\relax")
            .compile();
        refuse_removal_on_this_thread(false);

        assert!(req.last_error().is_none(), "{:?}", req.last_error());
        assert_eq!(req.output(), Some(&b"\\relax"[..]));
        assert!(req.report().is_some());
        assert!(matches!(req.cleanup_error(), Some(PipelineError::Cleanup { .. })));
        assert!(req.last_workspace().unwrap().is_dir());

        let target = root.path().join("out.pdf");
        req.save(&target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"\\relax");
    }

    #[cfg(unix)]
    #[test]
    fn test_stage_error_wins_over_cleanup_failure() {
        let root = tempfile::tempdir().unwrap();
        refuse_removal_on_this_thread(true);
        let req = fake_compiler(root.path(), "exit 3")
            .with_raw_input("\\relax")
            .compile();
        refuse_removal_on_this_thread(false);

        assert!(matches!(
            req.last_error(),
            Some(PipelineError::CompilerExecution { .. })
        ));
        assert!(matches!(req.cleanup_error(), Some(PipelineError::Cleanup { .. })));
        assert!(req.output().is_none());
        assert!(matches!(
            req.save(root.path().join("out.pdf")),
            Err(PipelineError::CompilerExecution { .. })
        ));
    }

    #[test]
    fn test_raw_input_flags_unused_template_settings() {
        let raw = CompilationRequest::new().with_raw_input("\\relax");
        assert!(!raw.ignores_template_settings());
        assert!(raw.clone().with_template_name("report.tmpl").ignores_template_settings());
        assert!(raw.clone().with_templates_folder("assets").ignores_template_settings());
        assert!(!raw
            .with_templates_folder("assets")
            .with_copy_files()
            .ignores_template_settings());
    }

    #[cfg(unix)]
    #[test]
    fn test_raw_input_with_unused_folder_still_compiles() {
        let root = tempfile::tempdir().unwrap();
        let req = fake_compiler(root.path(), r#"cat "$1" > "${1%.tex}.pdf""#)
            .with_templates_folder(root.path().join("unused"))
            .with_raw_input("\\relax")
            .compile();
        assert!(req.last_error().is_none(), "{:?}", req.last_error());
        assert_eq!(req.output(), Some(&b"\\relax"[..]));
    }

    #[test]
    fn test_replacing_render_functions_reloads_template() {
        let source = EmbeddedSource::new().with_file("templates/template.tmpl", "{{ shout() }}");
        let functions = RenderFunctions::new()
            .with("shout", |_: &HashMap<String, Value>| Ok(Value::String("HI".into())));
        let mut req = CompilationRequest::new()
            .with_file_system(source)
            .with_render_functions(functions);
        assert_eq!(req.document_source().unwrap(), "HI");

        let mut req = req.with_render_functions(RenderFunctions::new());
        assert!(req.template.is_none());
        assert!(matches!(req.document_source(), Err(PipelineError::Template(_))));
    }
}
