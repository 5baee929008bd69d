// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::ExecCapture;

use super::error::SessionError;
use super::{SessionManager, SshParams};

/// One reusable connection to the login node.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn ensure_connected(&self) -> anyhow::Result<()>;
    async fn exec_capture(&self, command: &str) -> Result<ExecCapture, SessionError>;
    async fn shutdown(&self);
}

pub trait SessionFactory: Send + Sync {
    fn build(&self) -> Arc<dyn RemoteSession>;
}

pub struct DefaultSessionFactory {
    params: SshParams,
}

impl DefaultSessionFactory {
    pub fn new(params: SshParams) -> Self {
        Self { params }
    }
}

impl SessionFactory for DefaultSessionFactory {
    fn build(&self) -> Arc<dyn RemoteSession> {
        Arc::new(SessionManager::new(self.params.clone()))
    }
}

/// Bounded set of sessions. At most `size` sessions exist; each is used by
/// one caller at a time. Sessions are created lazily and connect on first
/// use.
pub struct SessionPool {
    idle: Mutex<Vec<Arc<dyn RemoteSession>>>,
    permits: Semaphore,
    factory: Arc<dyn SessionFactory>,
    acquire_timeout: Duration,
    size: usize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, size: usize, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size),
            factory,
            acquire_timeout,
            size,
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits up to the acquire timeout for a free slot.
    pub async fn acquire(&self) -> AppResult<PooledSession<'_>> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                AppError::with_message(
                    AppErrorKind::Timeout,
                    codes::POOL_EXHAUSTED,
                    format!(
                        "no ssh session became free within {:?} (pool size {})",
                        self.acquire_timeout, self.size
                    ),
                )
            })?
            .map_err(|_| AppError::internal("ssh session pool is closed"))?;

        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        let session = reused.unwrap_or_else(|| self.factory.build());
        Ok(PooledSession {
            pool: self,
            session,
            broken: false,
            _permit: permit,
        })
    }

    /// Shuts down every idle session.
    pub async fn close_idle(&self) {
        let drained: Vec<_> = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for session in drained {
            session.shutdown().await;
        }
    }

    fn release(&self, session: Arc<dyn RemoteSession>, broken: bool) {
        if broken {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { session.shutdown().await });
            }
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(session);
    }
}

/// A checked-out session. Returned to the pool on drop; a session marked
/// broken is shut down instead and replaced on a later acquire.
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Arc<dyn RemoteSession>,
    broken: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledSession<'_> {
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledSession<'_> {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.session), self.broken);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct IdleSession;

    #[async_trait]
    impl RemoteSession for IdleSession {
        async fn ensure_connected(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn exec_capture(&self, _command: &str) -> Result<ExecCapture, SessionError> {
            Ok(ExecCapture {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: 0,
            })
        }

        async fn shutdown(&self) {}
    }

    #[derive(Default)]
    struct CountingFactory {
        built: AtomicUsize,
    }

    impl SessionFactory for CountingFactory {
        fn build(&self) -> Arc<dyn RemoteSession> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Arc::new(IdleSession)
        }
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_exhausted() {
        let factory = Arc::new(CountingFactory::default());
        let pool = SessionPool::new(factory, 2, Duration::from_millis(30));

        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let err = pool.acquire().await.err().expect("pool should be exhausted");
        assert_eq!(err.kind(), AppErrorKind::Timeout);
        assert_eq!(err.code(), codes::POOL_EXHAUSTED);

        drop(first);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn released_sessions_are_reused() {
        let factory = Arc::new(CountingFactory::default());
        let pool = SessionPool::new(factory.clone(), 1, Duration::from_millis(30));

        for _ in 0..3 {
            let session = pool.acquire().await.unwrap();
            session.exec_capture("true").await.unwrap();
        }
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn broken_sessions_are_replaced() {
        let factory = Arc::new(CountingFactory::default());
        let pool = SessionPool::new(factory.clone(), 1, Duration::from_millis(30));

        {
            let mut session = pool.acquire().await.unwrap();
            session.mark_broken();
        }
        let _session = pool.acquire().await.unwrap();
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiter_gets_released_slot() {
        let factory = Arc::new(CountingFactory::default());
        let pool = Arc::new(SessionPool::new(factory, 1, Duration::from_secs(5)));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
