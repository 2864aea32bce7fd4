/// Contextual information available to a running job via task-locals.
/// Accessible inside a job using `try_get_current_job_context()` or the
/// `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
  /// Name of the definition being executed.
  pub schedule: String,
  /// Occurrence id (`name|||versionHash|||due`) of the claim that triggered
  /// this run. `None` for broadcast echoes.
  pub occurrence: Option<String>,
  /// Identifier of the node executing the job.
  pub node_id: String,
  /// Whether this run was triggered by a multi broadcast from another node.
  pub echo: bool,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a job's execution scope.
    /// Set by the worker if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing job.
///
/// Returns `None` when called outside a job started by the scheduler. The
/// context is in scope both for the synchronous call of the job and for any
/// deferred future it returns.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a job
/// future where the context has not been set.
///
/// Use `try_get_current_job_context()` for optional access.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
