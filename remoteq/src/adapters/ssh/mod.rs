// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteExecPort};
use crate::app::services::backoff::RetryPolicy;

mod error;
mod session;

pub mod pool;

use pool::{DefaultSessionFactory, RemoteSession, SessionPool};

pub use error::{AuthenticationFailure, SessionError};
pub use session::{SessionManager, SshParams};

/// `RemoteExecPort` over a pool of SSH sessions to one login node.
pub struct SshConnector {
    pool: Arc<SessionPool>,
    retry: RetryPolicy,
    target: String,
}

impl SshConnector {
    pub fn new(params: SshParams, pool_size: usize, acquire_timeout: Duration, retry: RetryPolicy) -> Self {
        let target = format!("{}@{}:{}", params.username, params.host, params.port);
        let factory = Arc::new(DefaultSessionFactory::new(params));
        let pool = Arc::new(SessionPool::new(factory, pool_size, acquire_timeout));
        Self::with_pool(pool, retry, target)
    }

    pub fn with_pool(pool: Arc<SessionPool>, retry: RetryPolicy, target: impl Into<String>) -> Self {
        Self {
            pool,
            retry,
            target: target.into(),
        }
    }

    pub async fn shutdown(&self) {
        self.pool.close_idle().await;
    }
}

fn map_session_error(err: &SessionError) -> AppError {
    let code = match err {
        _ if err.is_auth_failure() => codes::AUTHENTICATION_FAILURE,
        SessionError::Connect(_) => codes::CONNECTION_FAILURE,
        SessionError::Channel(_) => codes::CHANNEL_BROKEN,
    };
    AppError::with_message(AppErrorKind::Connection, code, err.to_string())
}

async fn run_once(session: &dyn RemoteSession, command: &str) -> Result<ExecCapture, SessionError> {
    session
        .ensure_connected()
        .await
        .map_err(SessionError::Connect)?;
    session.exec_capture(command).await
}

#[async_trait]
impl RemoteExecPort for SshConnector {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, command),
        fields(op = "exec_capture", target = %self.target)
    )]
    async fn exec_capture(&self, command: &str, timeout: Duration) -> AppResult<ExecCapture> {
        let mut attempt: u32 = 0;
        loop {
            let mut session = self.pool.acquire().await?;
            let outcome = tokio::time::timeout(timeout, run_once(&*session, command)).await;
            match outcome {
                Ok(Ok(capture)) => {
                    tracing::debug!(exit_code = capture.exit_code, "remote command finished");
                    return Ok(capture);
                }
                Ok(Err(err @ SessionError::Connect(_))) => {
                    session.mark_broken();
                    drop(session);
                    if attempt >= self.retry.max_retries || err.is_auth_failure() {
                        tracing::warn!(attempts = attempt + 1, error = %err, "giving up on ssh connection");
                        return Err(map_session_error(&err).with_context(self.target.clone()));
                    }
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "ssh connection failed before dispatch; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(Err(err @ SessionError::Channel(_))) => {
                    // The command may have run; never send it twice.
                    session.mark_broken();
                    tracing::warn!(error = %err, "ssh channel broke after dispatch");
                    return Err(map_session_error(&err).with_context(self.target.clone()));
                }
                Err(_) => {
                    session.mark_broken();
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "remote command timed out");
                    return Err(AppError::with_message(
                        AppErrorKind::Timeout,
                        codes::TIMEOUT,
                        format!("remote command did not finish within {timeout:?}"),
                    )
                    .with_context(self.target.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::pool::SessionFactory;
    use super::*;

    enum Step {
        ConnectFails,
        AuthFails,
        ChannelBreaks,
        Hangs,
        Exits(i32, &'static str),
    }

    #[derive(Default)]
    struct Script {
        steps: Mutex<VecDeque<Step>>,
        dispatched: AtomicUsize,
    }

    impl Script {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                dispatched: AtomicUsize::new(0),
            })
        }

        fn pop(&self) -> Step {
            self.steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected ssh call"))
        }
    }

    struct ScriptedSession {
        script: Arc<Script>,
        pending: Mutex<Option<Step>>,
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn ensure_connected(&self) -> anyhow::Result<()> {
            match self.script.pop() {
                Step::ConnectFails => Err(anyhow!("connection refused")),
                Step::AuthFails => Err(AuthenticationFailure.into()),
                step => {
                    *self.pending.lock().unwrap() = Some(step);
                    Ok(())
                }
            }
        }

        async fn exec_capture(&self, _command: &str) -> Result<ExecCapture, SessionError> {
            self.script.dispatched.fetch_add(1, Ordering::SeqCst);
            let step = self.pending.lock().unwrap().take();
            match step {
                Some(Step::Exits(code, out)) => Ok(ExecCapture {
                    stdout: out.as_bytes().to_vec(),
                    stderr: Vec::new(),
                    exit_code: code,
                }),
                Some(Step::ChannelBreaks) => Err(SessionError::Channel(anyhow!("eof"))),
                Some(Step::Hangs) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(SessionError::Channel(anyhow!("hung")))
                }
                _ => panic!("exec without a scripted step"),
            }
        }

        async fn shutdown(&self) {}
    }

    struct ScriptedFactory(Arc<Script>);

    impl SessionFactory for ScriptedFactory {
        fn build(&self) -> Arc<dyn RemoteSession> {
            Arc::new(ScriptedSession {
                script: self.0.clone(),
                pending: Mutex::new(None),
            })
        }
    }

    fn connector(script: &Arc<Script>, max_retries: u32) -> SshConnector {
        let pool = Arc::new(SessionPool::new(
            Arc::new(ScriptedFactory(script.clone())),
            2,
            Duration::from_millis(100),
        ));
        let retry = RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        SshConnector::with_pool(pool, retry, "alice@login:22")
    }

    #[tokio::test]
    async fn retries_connect_failures_before_dispatch() {
        let script = Script::new(vec![
            Step::ConnectFails,
            Step::ConnectFails,
            Step::Exits(0, "ok\n"),
        ]);
        let capture = connector(&script, 3)
            .exec_capture("hostname", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(capture.stdout, b"ok\n");
        assert_eq!(script.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submission_survives_two_refused_connections() {
        use crate::adapters::scheduler::{PbsFlavor, default_adapters};
        use crate::app::submission::SubmissionEngine;
        use crate::app::testing::{ManualClock, at};
        use crate::app::types::{Job, JobCommand, JobState};

        let script = Script::new(vec![
            Step::ConnectFails,
            Step::ConnectFails,
            Step::Exits(0, "Submitted batch job 777\n"),
        ]);
        let submitter = SubmissionEngine::new(
            Arc::new(connector(&script, 3)),
            Arc::new(default_adapters(PbsFlavor::Pro)),
            Arc::new(ManualClock::new(at(0))),
            Duration::from_secs(1),
        );
        let mut job = Job::new("slurm", JobCommand::shell("echo hello"));

        submitter.submit(&mut job).await.unwrap();

        assert_eq!(job.state(), JobState::Submitted);
        assert_eq!(job.remote_id(), Some("777"));
        assert!(job.last_error().is_none());
        assert_eq!(script.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_after_retries() {
        let script = Script::new(vec![Step::ConnectFails, Step::ConnectFails]);
        let err = connector(&script, 1)
            .exec_capture("hostname", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Connection);
        assert_eq!(err.code(), codes::CONNECTION_FAILURE);
        assert_eq!(script.dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let script = Script::new(vec![Step::AuthFails]);
        let err = connector(&script, 3)
            .exec_capture("hostname", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::AUTHENTICATION_FAILURE);
    }

    #[tokio::test]
    async fn broken_channel_after_dispatch_is_not_retried() {
        let script = Script::new(vec![Step::ChannelBreaks, Step::Exits(0, "")]);
        let err = connector(&script, 3)
            .exec_capture("sbatch job.sh", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Connection);
        assert_eq!(err.code(), codes::CHANNEL_BROKEN);
        assert_eq!(script.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result() {
        let script = Script::new(vec![Step::Exits(2, "")]);
        let capture = connector(&script, 3)
            .exec_capture("false", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(capture.exit_code, 2);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let script = Script::new(vec![Step::Hangs]);
        let err = connector(&script, 3)
            .exec_capture("sleep 100", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Timeout);
        assert_eq!(err.code(), codes::TIMEOUT);
    }
}
