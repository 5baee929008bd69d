// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
#[error("authentication_failure")]
pub struct AuthenticationFailure;

/// Where a remote command failed, which decides whether running it again is
/// safe.
#[derive(Debug, ThisError)]
pub enum SessionError {
    /// Connecting, authenticating or opening the channel failed; the command
    /// never reached the server.
    #[error("ssh connect failed: {0:#}")]
    Connect(anyhow::Error),
    /// The command was sent and the channel broke before it reported an exit
    /// status. The command may or may not have run.
    #[error("ssh channel failed after dispatch: {0:#}")]
    Channel(anyhow::Error),
}

impl SessionError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            SessionError::Connect(err) | SessionError::Channel(err) => err
                .chain()
                .any(|cause| cause.is::<AuthenticationFailure>()),
        }
    }
}
