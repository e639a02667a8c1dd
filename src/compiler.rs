//! Compiler Invoker
//!
//! Runs the external TeX engine inside a workspace. The working directory is
//! passed to the process launch, never set on the current process: sibling
//! compilations in the same process rely on the shared cwd staying put.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{InvocationFailure, PipelineError};

/// File the compiler's stdout and stderr are redirected to.
pub const COMPILER_LOG_NAME: &str = "compiler-output.log";

const LOG_TAIL_LINES: usize = 20;
const POLL_START: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

/// Supported TeX engines. Closed set: each maps to one executable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    #[default]
    PdfLatex,
    XeLatex,
}

impl Compiler {
    pub const ALL: [Compiler; 2] = [Compiler::PdfLatex, Compiler::XeLatex];

    /// Executable name looked up on `PATH`.
    pub fn program(self) -> &'static str {
        match self {
            Self::PdfLatex => "pdflatex",
            Self::XeLatex => "xelatex",
        }
    }

    pub fn output_extension(self) -> &'static str {
        "pdf"
    }

    /// Flags passed ahead of the source file unless overridden.
    pub fn default_args(self) -> Vec<String> {
        vec![
            "-interaction=nonstopmode".to_string(),
            "-halt-on-error".to_string(),
        ]
    }

    /// Name of the artifact produced from `source_name` (same stem).
    pub fn output_name(self, source_name: &str) -> String {
        let stem = Path::new(source_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_name.to_string());
        format!("{}.{}", stem, self.output_extension())
    }

    /// Whether the executable can be launched from this process.
    pub fn is_available(self) -> bool {
        Command::new(self.program())
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for Compiler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdflatex" => Ok(Self::PdfLatex),
            "xelatex" => Ok(Self::XeLatex),
            other => Err(format!("unknown compiler '{other}' (expected pdflatex or xelatex)")),
        }
    }
}

/// A single compiler run, fully described before launch.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub compiler: Compiler,
    /// Executable override; `None` uses `compiler.program()`.
    pub program: Option<PathBuf>,
    /// Flags placed before the source file name.
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(compiler: Compiler) -> Self {
        Self {
            compiler,
            program: None,
            args: compiler.default_args(),
            timeout: None,
        }
    }

    fn command(&self, workdir: &Path, source_name: &str) -> Command {
        let mut cmd = match &self.program {
            Some(program) => Command::new(program),
            None => Command::new(self.compiler.program()),
        };
        cmd.args(&self.args).arg(source_name).current_dir(workdir);
        cmd
    }

    /// Run the compiler on `source_name` inside `workdir` and wait for it.
    ///
    /// Output goes to [`COMPILER_LOG_NAME`] in `workdir` so a chatty
    /// compiler can never stall on a full pipe. On timeout the process is
    /// killed and reaped before returning.
    pub fn run(&self, workdir: &Path, source_name: &str) -> Result<(), PipelineError> {
        let log_path = workdir.join(COMPILER_LOG_NAME);
        let log = File::create(&log_path)
            .map_err(|e| PipelineError::staging("create", &log_path, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| PipelineError::staging("duplicate handle for", &log_path, e))?;

        tracing::debug!(
            compiler = %self.compiler,
            workdir = %workdir.display(),
            source = source_name,
            "launching compiler"
        );

        let child = self
            .command(workdir, source_name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| self.failure(source_name, InvocationFailure::Launch(Arc::new(e))))?;

        let status = match self.timeout {
            None => wait(child),
            Some(timeout) => wait_with_deadline(child, timeout),
        }
        .map_err(|e| self.failure(source_name, InvocationFailure::Wait(Arc::new(e))))?;

        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(self.failure(
                source_name,
                InvocationFailure::Exit {
                    code: status.code(),
                    log_tail: log_tail(&log_path),
                },
            )),
            None => Err(PipelineError::CompilerTimeout {
                compiler: self.compiler,
                timeout: self.timeout.unwrap_or_default(),
            }),
        }
    }

    fn failure(&self, source_name: &str, cause: InvocationFailure) -> PipelineError {
        PipelineError::CompilerExecution {
            compiler: self.compiler,
            source_file: source_name.to_string(),
            cause,
        }
    }
}

fn wait(mut child: Child) -> std::io::Result<Option<ExitStatus>> {
    child.wait().map(Some)
}

/// `Ok(None)` means the deadline passed and the child was killed.
fn wait_with_deadline(mut child: Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    let mut interval = POLL_START;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(pid = child.id(), ?timeout, "compiler deadline passed, killing");
            // Already-exited races are fine: kill reports an error, wait reaps.
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(interval.min(deadline - now));
        interval = (interval * 2).min(POLL_MAX);
    }
}

fn log_tail(path: &Path) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].join("\n")
}
