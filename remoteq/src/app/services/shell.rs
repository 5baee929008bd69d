// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::errors::{AppError, AppResult};

/// Single-quotes a word for a POSIX shell.
pub fn sh_escape(p: &str) -> String {
    let mut out = String::from("'");
    out.push_str(&p.replace('\'', r"'\''"));
    out.push('\'');
    out
}

/// Builds `command <<'DELIM'` with `body` as a quoted here-document, so the
/// remote shell expands nothing inside it.
pub fn heredoc(command: &str, delimiter: &str, body: &str) -> AppResult<String> {
    if body.lines().any(|line| line == delimiter) {
        return Err(AppError::invalid_argument(format!(
            "here-document body contains its own delimiter '{delimiter}'"
        )));
    }
    let mut out = format!("{command} <<'{delimiter}'\n{body}");
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(delimiter);
    out.push('\n');
    Ok(out)
}

/// Scheduler directive values end up on a `#SBATCH`/`#PBS` line and must
/// stay one shell-free token.
pub fn ensure_directive_value(field: &str, value: &str) -> AppResult<()> {
    if value.is_empty() {
        return Err(AppError::invalid_argument(format!("{field} must not be empty")));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::invalid_argument(format!(
            "{field} must not contain whitespace or control characters: {value:?}"
        )));
    }
    Ok(())
}

pub fn ensure_single_line(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::invalid_argument(format!("{field} must not be empty")));
    }
    if value.contains(['\n', '\r']) {
        return Err(AppError::invalid_argument(format!(
            "{field} must be a single line"
        )));
    }
    Ok(())
}
