// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, anyhow};
use russh::ChannelMsg;

use crate::adapters::ssh::error::SessionError;
use crate::app::ports::ExecCapture;

use super::SessionManager;

/// Exit code reported when the remote process died from a signal and the
/// server sent no numeric status.
const SIGNALLED_EXIT_CODE: i32 = 255;

/// Folds one channel message into the capture buffers. Returns `true` once
/// the channel is closed.
fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut Option<i32>,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = Some(*exit_status as i32);
            false
        }
        ChannelMsg::ExitSignal { signal_name, .. } => {
            tracing::debug!(signal = ?signal_name, "remote command killed by signal");
            code.get_or_insert(SIGNALLED_EXIT_CODE);
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

impl SessionManager {
    /// Runs one command on a fresh channel and collects its output.
    ///
    /// Failing to open the channel means nothing was sent (`Connect`); any
    /// failure from the exec request on is `Channel`.
    pub async fn exec_capture(&self, cmd: &str) -> Result<ExecCapture, SessionError> {
        // Hold the handle lock only while opening the channel; the keepalive
        // task needs it too.
        let mut chan = {
            let guard = self.handle.lock().await;
            let handle = guard
                .as_ref()
                .ok_or_else(|| SessionError::Connect(anyhow!("SSH handle lost")))?;
            handle
                .channel_open_session()
                .await
                .context("open session channel")
                .map_err(SessionError::Connect)?
        };
        tracing::debug!(command = %cmd, "exec");
        chan.exec(true, cmd)
            .await
            .context("exec request")
            .map_err(SessionError::Channel)?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        while let Some(msg) = chan.wait().await {
            if handle_capture_message(&msg, &mut out, &mut err, &mut code) {
                break;
            }
        }
        let _ = chan.close().await;

        let exit_code = code.ok_or_else(|| {
            SessionError::Channel(anyhow!("channel closed before the command reported an exit status"))
        })?;
        Ok(ExecCapture {
            stdout: out,
            stderr: err,
            exit_code,
        })
    }
}
