// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
/// Remote command execution on the cluster's login node.
/// A nonzero exit code is a normal result; only transport problems are errors
/// (`Connection` when the host is unreachable or refuses us, `Timeout` when the
/// command does not finish within `timeout`).
pub trait RemoteExecPort: Send + Sync {
    async fn exec_capture(&self, command: &str, timeout: Duration) -> AppResult<ExecCapture>;
}
