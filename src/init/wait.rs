// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::error;

use crate::error::BoxError;

pub type TaskSet = JoinSet<Result<(), BoxError>>;

/// Resolves when any task finishes, with that task's result.
pub async fn wait_for_any_task(tasks: &mut TaskSet) -> Result<(), BoxError> {
    match tasks.join_next().await {
        None => std::future::pending().await,
        Some(res) => res?,
    }
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut TaskSet,
    timeout: Duration,
) -> Result<(), BoxError> {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

/// Wait for every task, keeping the last error. Tasks still running at the
/// deadline are left in the set.
pub async fn wait_for_tasks_with_deadline(
    tasks: &mut TaskSet,
    stop_at: Instant,
) -> Result<(), BoxError> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => {
                error!(error = %e, "Failed to join with task");
                result = Err(e.into());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_task_returns_first_result() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async { Err::<(), BoxError>("boom".into()) });
        tasks.spawn(std::future::pending());

        let err = wait_for_any_task(&mut tasks).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_deadline_reports_timeout() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(std::future::pending());

        let res = wait_for_tasks_with_timeout(&mut tasks, Duration::from_millis(20)).await;
        assert!(res.is_err());
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_collects_errors() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(async { Err::<(), BoxError>("late failure".into()) });

        let res = wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(5)).await;
        assert_eq!(res.unwrap_err().to_string(), "late failure");
    }
}
