// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Scripted doubles shared by the app-layer tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, ExecCapture, RemoteExecPort};

pub(crate) fn capture(stdout: &str, stderr: &str, exit_code: i32) -> ExecCapture {
    ExecCapture {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code,
    }
}

pub(crate) fn ok(stdout: &str) -> AppResult<ExecCapture> {
    Ok(capture(stdout, "", 0))
}

pub(crate) fn connection_refused() -> AppResult<ExecCapture> {
    Err(AppError::with_message(
        AppErrorKind::Connection,
        codes::CONNECTION_FAILURE,
        "connection refused",
    ))
}

pub(crate) fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_800_000_000 + secs).expect("valid timestamp")
}

/// Clock that only moves when told to.
pub(crate) struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub(crate) fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl ClockPort for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock lock")
    }
}

struct Rule {
    prefix: String,
    replies: VecDeque<AppResult<ExecCapture>>,
}

/// Answers remote commands by prefix. Each rule replays its replies in
/// order; a command with no matching reply left fails the test.
#[derive(Default)]
pub(crate) struct ScriptedRemoteExec {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    holds: Mutex<Vec<(String, Arc<Notify>)>>,
}

impl ScriptedRemoteExec {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, prefix: &str, reply: AppResult<ExecCapture>) -> &Self {
        let mut rules = self.rules.lock().expect("rules lock");
        match rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                prefix: prefix.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    /// Parks the next command starting with `prefix` until the returned
    /// gate is notified. The call is recorded before it parks.
    pub(crate) fn hold(&self, prefix: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.holds
            .lock()
            .expect("holds lock")
            .push((prefix.to_string(), gate.clone()));
        gate
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn calls_starting_with(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

#[async_trait::async_trait]
impl RemoteExecPort for ScriptedRemoteExec {
    async fn exec_capture(&self, command: &str, _timeout: Duration) -> AppResult<ExecCapture> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(command.to_string());
        let reply = self
            .rules
            .lock()
            .expect("rules lock")
            .iter_mut()
            .find(|rule| command.starts_with(&rule.prefix) && !rule.replies.is_empty())
            .and_then(|rule| rule.replies.pop_front());
        let gate = {
            let mut holds = self.holds.lock().expect("holds lock");
            holds
                .iter()
                .position(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|index| holds.remove(index).1)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match reply {
            Some(reply) => reply,
            None => panic!("unexpected remote command: {command}"),
        }
    }
}
