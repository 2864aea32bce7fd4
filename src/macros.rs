/// Builds a job callable that settles asynchronously.
///
/// Expands to a `move |definition: Definition| -> JobOutcome` closure. The
/// optional setup block runs synchronously on every invocation (clone `Arc`s
/// there); the main block is wrapped in `async move` and must evaluate to a
/// [`JobResult`](crate::job::JobResult).
///
/// # Usage
///
/// ```ignore
/// use clusterkeeper::job_fn;
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
///
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// // With setup block:
/// let counting = job_fn!(|schedule| {
///   let counter = counter.clone();
/// } {
///   let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
///   Ok(serde_json::json!({ "schedule": schedule.name, "count": count }))
/// });
///
/// // Without setup block:
/// let echo = job_fn!(|schedule| {
///   Ok(schedule.data.clone())
/// });
///
/// node.register_job("jobs.count", counting);
/// node.register_job("jobs.echo", echo);
/// ```
#[macro_export]
macro_rules! job_fn {
  (
    |$definition:ident| { $($setup_stmts:stmt);* $(;)? }
    $main_block:block
  ) => {
    move |$definition: $crate::job::Definition| {
      $($setup_stmts;)*
      $crate::job::JobOutcome::deferred(async move { $main_block })
    }
  };

  (
    |$definition:ident| $main_block:block
  ) => {
    move |$definition: $crate::job::Definition| {
      $crate::job::JobOutcome::deferred(async move { $main_block })
    }
  };
}
