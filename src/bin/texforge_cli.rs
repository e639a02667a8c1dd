//! TexForge CLI - Bridge interface for scripts
//!
//! Commands: compile, check
//! Outputs JSON to stdout, logs to stderr
//! Returns non-zero on failure

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use texforge_core::{CompilationRequest, CompileSettings, Compiler, PipelineError};

#[derive(Parser)]
#[command(name = "texforge-cli")]
#[command(about = "TexForge CLI - TeX templates to PDF")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON settings file (CompileSettings); flags override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a template folder or a raw .tex file
    Compile {
        /// Path to templates directory
        #[arg(short, long)]
        templates_dir: Option<PathBuf>,

        /// Template file name inside the templates directory
        #[arg(short = 'n', long)]
        template_name: Option<String>,

        /// JSON data payload
        #[arg(short, long, conflicts_with = "input")]
        data: Option<String>,

        /// Raw .tex file compiled verbatim (no templating)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// pdflatex or xelatex
        #[arg(long)]
        compiler: Option<Compiler>,

        /// Copy the templates directory into the workspace
        #[arg(long)]
        copy_files: bool,

        /// Kill the compiler after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Where to write the PDF
        #[arg(short, long, default_value = "out.pdf")]
        output: PathBuf,

        /// Also embed the PDF as base64 in the JSON result
        #[arg(long)]
        embed: bool,
    },

    /// Report which compilers can be launched
    Check,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("texforge_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => match CompileSettings::load(path) {
            Ok(s) => s,
            Err(e) => return fail(&e),
        },
        None => CompileSettings::default(),
    };

    match cli.command {
        Commands::Check => {
            let compilers: Vec<_> = Compiler::ALL
                .iter()
                .map(|c| serde_json::json!({
                    "compiler": c,
                    "program": c.program(),
                    "available": c.is_available(),
                }))
                .collect();
            print_json(&serde_json::json!({ "compilers": compilers }));
            ExitCode::SUCCESS
        }

        Commands::Compile {
            templates_dir,
            template_name,
            data,
            input,
            compiler,
            copy_files,
            timeout,
            output,
            embed,
        } => {
            let mut request = CompilationRequest::from_settings(&settings);
            if let Some(dir) = templates_dir {
                request = request.with_templates_folder(dir);
            }
            if let Some(name) = template_name {
                request = request.with_template_name(name);
            }
            if let Some(compiler) = compiler {
                request = request.with_compiler(compiler);
            }
            if copy_files {
                request = request.with_copy_files();
            }
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            if let Some(data) = data {
                let value: serde_json::Value = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(e) => {
                        return fail(&PipelineError::Configuration(format!("invalid data: {e}")))
                    }
                };
                request = request.with_data(&value);
            }
            if let Some(path) = input {
                match std::fs::read_to_string(&path) {
                    Ok(text) => request = request.with_raw_input(text),
                    Err(e) => {
                        return fail(&PipelineError::Configuration(format!(
                            "could not read {}: {e}",
                            path.display()
                        )))
                    }
                }
            }

            let request = request.compile();
            if let Err(e) = request.save(&output) {
                return fail(&e);
            }

            let mut result = serde_json::json!({
                "success": true,
                "output": output,
                "report": request.report(),
            });
            if let Some(cleanup) = request.cleanup_error() {
                result["warning"] = serde_json::Value::String(cleanup.to_string());
            }
            if embed {
                if let Some(bytes) = request.output() {
                    result["data_base64"] = serde_json::Value::String(base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        bytes,
                    ));
                }
            }
            print_json(&result);
            ExitCode::SUCCESS
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("could not serialize result: {e}"),
    }
}

fn fail(err: &PipelineError) -> ExitCode {
    let output = serde_json::json!({
        "success": false,
        "kind": err.kind(),
        "error": err.to_string(),
    });
    println!("{output}");
    ExitCode::from(2)
}
