// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const CHANNEL_BROKEN: &str = "channel_broken";
    pub const TIMEOUT: &str = "timeout";
    pub const POOL_EXHAUSTED: &str = "pool_exhausted";
    pub const SUBMISSION_REJECTED: &str = "submission_rejected";
    pub const SUBMISSION_UNPARSEABLE: &str = "submission_unparseable";
    pub const ACCOUNTING_PENDING: &str = "accounting_pending";
    pub const ACCOUNTING_UNAVAILABLE: &str = "accounting_unavailable";
    pub const STATUS_QUERY_FAILED: &str = "status_query_failed";
    pub const UNSUPPORTED_OPERATION: &str = "unsupported_operation";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const STORE_ERROR: &str = "store_error";
}

/// Whether an accounting lookup is worth repeating later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingErrorKind {
    /// Records are not (yet) available; a later query may succeed.
    Transient,
    /// Accounting is disabled or the records are gone for good.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    Connection,
    Timeout,
    Submission,
    Accounting(AccountingErrorKind),
    UnsupportedOperation,
    InvalidArgument,
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            message,
        )
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::with_message(
            AppErrorKind::UnsupportedOperation,
            codes::UNSUPPORTED_OPERATION,
            message,
        )
    }

    pub fn accounting_transient(message: impl Into<String>) -> Self {
        Self::with_message(
            AppErrorKind::Accounting(AccountingErrorKind::Transient),
            codes::ACCOUNTING_PENDING,
            message,
        )
    }

    pub fn accounting_permanent(message: impl Into<String>) -> Self {
        Self::with_message(
            AppErrorKind::Accounting(AccountingErrorKind::Permanent),
            codes::ACCOUNTING_UNAVAILABLE,
            message,
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::NotFound, codes::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::Conflict, codes::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, message)
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Connection and timeout failures: the remote side was never reached or
    /// never answered, so the caller may try again.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, AppErrorKind::Connection | AppErrorKind::Timeout)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_appends_context() {
        let err = AppError::with_message(
            AppErrorKind::Connection,
            codes::CONNECTION_FAILURE,
            "ssh connect failed",
        )
        .with_context("cluster.example.org:22");
        assert_eq!(err.to_string(), "ssh connect failed (cluster.example.org:22)");
        assert_eq!(err.code(), codes::CONNECTION_FAILURE);
        assert!(err.is_transport());
    }

    #[test]
    fn accounting_helpers_carry_retry_class() {
        assert_eq!(
            AppError::accounting_transient("not yet").kind(),
            AppErrorKind::Accounting(AccountingErrorKind::Transient)
        );
        let permanent = AppError::accounting_permanent("disabled");
        assert_eq!(
            permanent.kind(),
            AppErrorKind::Accounting(AccountingErrorKind::Permanent)
        );
        assert!(!permanent.is_transport());
    }
}
