//! Bounded polling of side-channel generation jobs
//!
//! Image and video generation endpoints typically return a job handle that
//! has to be polled until it completes. Polling here is bounded both by an
//! attempt count and by a wall-clock ceiling, and checks the cancellation
//! token on every iteration.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ForkchatError, Result};

/// Status reported by one poll of a generation job
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Still running
    Pending,
    /// Finished with a payload
    Succeeded {
        /// Generated bytes
        bytes: Vec<u8>,
        /// MIME type of the payload
        mime_type: String,
    },
    /// Terminal failure reported by the backend
    Failed(String),
}

/// A pollable media generation job
#[async_trait]
pub trait GenerationJob: Send {
    /// Queries the backend once
    ///
    /// A returned error is treated as transient and counts as one attempt.
    async fn poll(&mut self) -> Result<JobStatus>;
}

/// Polling bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobPolicy {
    /// Delay between polls
    pub interval: Duration,
    /// Maximum number of polls
    pub max_attempts: u32,
    /// Wall-clock ceiling for the whole job
    pub timeout: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            max_attempts: 90,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Output of a successful job
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedMedia {
    /// Generated bytes
    pub bytes: Vec<u8>,
    /// MIME type of the payload
    pub mime_type: String,
}

/// Polls `job` until it reaches a terminal state
///
/// Returns `Ok(None)` when `cancel` fires; cancellation is not an error.
///
/// # Errors
///
/// - `ForkchatError::JobFailed` when the backend reports failure
/// - `ForkchatError::JobTimedOut` when attempts or the wall-clock ceiling
///   are exhausted
pub async fn poll_until_done(
    job: &mut dyn GenerationJob,
    policy: JobPolicy,
    cancel: &CancellationToken,
) -> Result<Option<GeneratedMedia>> {
    let deadline = Instant::now() + policy.timeout;

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = sleep_until(deadline) => {
                return Err(ForkchatError::JobTimedOut { attempts: attempt - 1 }.into());
            }
            status = job.poll() => status,
        };

        match status {
            Ok(JobStatus::Succeeded { bytes, mime_type }) => {
                tracing::debug!(attempt, size = bytes.len(), "Generation job finished");
                return Ok(Some(GeneratedMedia { bytes, mime_type }));
            }
            Ok(JobStatus::Failed(reason)) => {
                return Err(ForkchatError::JobFailed(reason).into());
            }
            Ok(JobStatus::Pending) => {
                tracing::trace!(attempt, "Generation job pending");
            }
            Err(e) => {
                tracing::warn!(attempt, "Generation job poll failed: {}", e);
            }
        }

        if attempt == policy.max_attempts {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = sleep_until(deadline) => {
                return Err(ForkchatError::JobTimedOut { attempts: attempt }.into());
            }
            _ = sleep(policy.interval) => {}
        }
    }

    Err(ForkchatError::JobTimedOut {
        attempts: policy.max_attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedJob {
        script: Vec<Result<JobStatus>>,
        polls: u32,
    }

    impl ScriptedJob {
        fn new(script: Vec<Result<JobStatus>>) -> Self {
            Self { script, polls: 0 }
        }
    }

    #[async_trait]
    impl GenerationJob for ScriptedJob {
        async fn poll(&mut self) -> Result<JobStatus> {
            self.polls += 1;
            if self.script.is_empty() {
                Ok(JobStatus::Pending)
            } else {
                self.script.remove(0)
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> JobPolicy {
        JobPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_job_succeeds_after_pending() {
        let mut job = ScriptedJob::new(vec![
            Ok(JobStatus::Pending),
            Err(anyhow::anyhow!("flaky")),
            Ok(JobStatus::Succeeded {
                bytes: vec![1, 2],
                mime_type: "image/png".into(),
            }),
        ]);
        let out = poll_until_done(&mut job, fast_policy(10), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.bytes, vec![1, 2]);
        assert_eq!(job.polls, 3);
    }

    #[tokio::test]
    async fn test_job_failure_is_terminal() {
        let mut job = ScriptedJob::new(vec![Ok(JobStatus::Failed("nsfw".into()))]);
        let err = poll_until_done(&mut job, fast_policy(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::JobFailed(_))
        ));
        assert_eq!(job.polls, 1);
    }

    #[tokio::test]
    async fn test_job_attempts_are_bounded() {
        let mut job = ScriptedJob::new(vec![]);
        let err = poll_until_done(&mut job, fast_policy(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::JobTimedOut { attempts: 3 })
        ));
        assert_eq!(job.polls, 3);
    }

    #[tokio::test]
    async fn test_job_wall_clock_ceiling() {
        let mut job = ScriptedJob::new(vec![]);
        let policy = JobPolicy {
            interval: Duration::from_millis(50),
            max_attempts: 1_000,
            timeout: Duration::from_millis(120),
        };
        let err = poll_until_done(&mut job, policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::JobTimedOut { .. })
        ));
        assert!(job.polls < 10);
    }

    #[tokio::test]
    async fn test_cancelled_job_returns_none() {
        let mut job = ScriptedJob::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = poll_until_done(&mut job, fast_policy(10), &cancel)
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(job.polls, 0);
    }
}
