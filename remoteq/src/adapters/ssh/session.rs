// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::anyhow;
use async_trait::async_trait;
use russh::client::Config;
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use russh::keys::ssh_key::PublicKey;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::app::ports::ExecCapture;

use super::error::SessionError;
use super::pool::RemoteSession;

mod auth;
mod exec;


/// russh client handler; only server key checking is customized.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts: KnownHosts,
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        self.known_hosts
            .verify(&self.host, self.addr, server_public_key)
    }
}

/// Parameters for establishing the SSH connection to the login node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    /// Hostname or IP, also the known_hosts lookup key.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: Option<PathBuf>,
    /// Defaults to `~/.ssh/known_hosts` when unset.
    pub known_hosts_path: Option<PathBuf>,
    pub keepalive_secs: u64,
}

/// Trust-on-first-use view of a known_hosts file; `None` means the user's
/// default file.
#[derive(Clone, Debug, Default)]
struct KnownHosts {
    file: Option<PathBuf>,
}

impl KnownHosts {
    fn new(file: Option<PathBuf>) -> Self {
        Self { file }
    }

    fn contains(&self, name: &str, port: u16, key: &PublicKey) -> Result<bool, russh::keys::Error> {
        match &self.file {
            Some(file) => russh::keys::check_known_hosts_path(name, port, key, file),
            None => russh::keys::check_known_hosts(name, port, key),
        }
    }

    fn remember(&self, name: &str, port: u16, key: &PublicKey) -> Result<(), russh::keys::Error> {
        match &self.file {
            Some(file) => learn_known_hosts_path(name, port, key, file),
            None => learn_known_hosts(name, port, key),
        }
    }

    /// The key matches when recorded under the hostname or the resolved IP.
    /// Unknown hosts are recorded under the hostname; a mismatch is an error.
    fn verify(&self, host: &str, addr: SocketAddr, key: &PublicKey) -> anyhow::Result<bool> {
        let port = addr.port();
        let ip = addr.ip().to_string();
        let names: Vec<&str> = if ip == host {
            vec![host]
        } else {
            vec![host, ip.as_str()]
        };

        for name in &names {
            match self.contains(name, port, key) {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(%host, port, error = %err, "host key mismatch");
                    return Err(anyhow!("host key for {host}:{port} rejected: {err}"));
                }
            }
        }

        tracing::info!(%host, port, looked_up = ?names, "recording new host key");
        self.remember(host, port, key)
            .map_err(|err| anyhow!("could not record host key for {host}:{port}: {err}"))?;
        Ok(true)
    }
}

/// Owns one SSH connection. The pool hands a manager to one caller at a
/// time; the handle mutex only guards against the keepalive task.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: Some(Duration::from_secs(
                (params.keepalive_secs * 4).max(60),
            )),
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs.max(1))),
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        if let Some(handle) = handle_field.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

#[async_trait]
impl RemoteSession for SessionManager {
    async fn ensure_connected(&self) -> anyhow::Result<()> {
        SessionManager::ensure_connected(self).await
    }

    async fn exec_capture(&self, command: &str) -> Result<ExecCapture, SessionError> {
        SessionManager::exec_capture(self, command).await
    }

    async fn shutdown(&self) {
        SessionManager::shutdown(self).await
    }
}
