//! TexForge Core - Document Compiler
//!
//! Template + data -> TeX source -> external compiler -> PDF bytes.
//!
//! # Ground Rules
//! 1. One workspace per attempt, always removed afterwards
//! 2. The process working directory is never changed
//! 3. The first error wins and is never overwritten
//! 4. Raw input bypasses templating entirely

pub mod batch;
pub mod compiler;
pub mod error;
pub mod hashing;
pub mod pipeline;
pub mod retrieve;
pub mod settings;
pub mod stage;
pub mod templates;
pub mod workspace;

pub use compiler::{Compiler, Invocation};
pub use error::{InvocationFailure, PipelineError};
pub use hashing::{canonical_json, compute_job_hash, sha256_hex};
pub use pipeline::{compile_folder, compile_folder_with, CompilationReport, CompilationRequest};
pub use settings::CompileSettings;
pub use templates::{DiskSource, EmbeddedSource, RenderFunctions, TemplateSource};
pub use workspace::Workspace;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
