// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::client::{AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::adapters::ssh::AuthenticationFailure;

use super::{ClientHandler, KnownHosts, SessionManager};

fn auth_succeeded(result: &AuthResult) -> bool {
    matches!(result, AuthResult::Success)
}

impl SessionManager {
    /// Connects and authenticates unless a live handle already exists.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut slot = self.handle.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_closed()) {
            tracing::trace!(host = %self.params.host, "ssh connection reused");
            return Ok(());
        }

        let addr = self.resolve().await?;
        tracing::info!(
            host = %self.params.host,
            user = %self.params.username,
            %addr,
            "opening ssh connection"
        );
        let handler = ClientHandler {
            host: self.params.host.clone(),
            addr,
            known_hosts: KnownHosts::new(self.params.known_hosts_path.clone()),
        };
        let mut handle = russh::client::connect(self.config.clone(), addr, handler)
            .await
            .with_context(|| format!("ssh connect to {addr} failed"))?;
        self.authenticate(&mut handle).await?;
        *slot = Some(handle);
        drop(slot);

        if let Some(interval) = self.config.keepalive_interval {
            let task = spawn_keepalive(self.handle.clone(), interval);
            if let Some(previous) = self.keepalive_task_handle.lock().await.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host = self.params.host.as_str();
        let mut addrs = tokio::net::lookup_host((host, self.params.port))
            .await
            .with_context(|| format!("cannot resolve {host}"))?;
        addrs
            .next()
            .ok_or_else(|| anyhow!("{host} resolved to no addresses"))
    }

    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<()> {
        let identity = self
            .params
            .identity_path
            .as_ref()
            .ok_or_else(|| anyhow!("public key auth needs an identity file"))?;
        let secret = russh::keys::load_secret_key(identity, None)
            .with_context(|| format!("cannot read identity {}", identity.display()))?;
        // RSA keys sign with the strongest hash the server offers.
        let hash = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey(
                self.params.username.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(secret), hash),
            )
            .await?;
        if auth_succeeded(&result) {
            return Ok(());
        }
        tracing::warn!(
            host = %self.params.host,
            user = %self.params.username,
            "server rejected public key"
        );
        Err(AuthenticationFailure.into())
    }
}

fn spawn_keepalive(
    handle: Arc<Mutex<Option<Handle<ClientHandler>>>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval / 2);
        loop {
            ticker.tick().await;
            let guard = handle.lock().await;
            match guard.as_ref() {
                Some(h) if !h.is_closed() => {
                    if let Err(err) = h.send_keepalive(true).await {
                        tracing::debug!(error = %err, "keepalive not sent");
                    }
                }
                _ => {
                    tracing::debug!("keepalive stopped; connection gone");
                    break;
                }
            }
        }
    })
}
