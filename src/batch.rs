//! Batch compilation on a bounded worker pool.
//!
//! Requests share nothing, so they can run side by side; the pool only caps
//! how many compiler processes are alive at once.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::PipelineError;
use crate::pipeline::CompilationRequest;

/// Compile every request with at most `max_parallel` running at a time.
///
/// Results come back in input order; each request carries its own output or
/// sticky error. `max_parallel == 0` lets rayon pick the thread count.
pub fn compile_all(
    requests: Vec<CompilationRequest>,
    max_parallel: usize,
) -> Result<Vec<CompilationRequest>, PipelineError> {
    if requests.is_empty() {
        return Ok(vec![]);
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(max_parallel)
        .thread_name(|i| format!("texforge-worker-{i}"))
        .build()
        .map_err(|e| PipelineError::Configuration(format!("could not start worker pool: {e}")))?;

    tracing::debug!(jobs = requests.len(), threads = pool.current_num_threads(), "batch start");

    let done: Vec<CompilationRequest> =
        pool.install(|| requests.into_par_iter().map(CompilationRequest::compile).collect());

    let failed = done.iter().filter(|r| r.last_error().is_some()).count();
    tracing::info!(jobs = done.len(), failed, "batch finished");
    Ok(done)
}
