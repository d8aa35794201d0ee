//! Run identity for clients built in generic mode.
//!
//! A generic client resolves the run it operates on from the calling task,
//! so one client can serve several runs at once. The identity is scoped with
//! [`with_run_params`]; it is not inherited by tasks spawned inside the scope.
use rendezvous_common::RunParams;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static RUN_PARAMS: Arc<RunParams>;
}

/// Run `fut` with `params` as the current run identity.
pub async fn with_run_params<F>(params: RunParams, fut: F) -> F::Output
where
    F: Future,
{
    RUN_PARAMS.scope(Arc::new(params), fut).await
}

/// The run identity bound to the current task, if any.
pub fn current_run_params() -> Option<Arc<RunParams>> {
    RUN_PARAMS.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_binds_and_unbinds_params() {
        assert!(current_run_params().is_none());
        let seen = with_run_params(RunParams::new("p", "c", "r"), async {
            current_run_params().map(|params| params.test_run.clone())
        })
        .await;
        assert_eq!(seen.as_deref(), Some("r"));
        assert!(current_run_params().is_none());
    }

    #[tokio::test]
    async fn spawned_tasks_do_not_inherit_params() {
        let inherited = with_run_params(RunParams::new("p", "c", "r"), async {
            tokio::spawn(async { current_run_params().is_some() })
                .await
                .expect("join")
        })
        .await;
        assert!(!inherited);
    }
}
