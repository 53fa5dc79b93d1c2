//! SSH transport built on `russh`.
//!
//! Guests are freshly cloned and their host keys are unknown, so every
//! server key is accepted. Authentication is password-only: no agent, no
//! key files.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tracing::{debug, warn};

use super::{CommandOutput, ExecError, ShellSession, ShellTransport};

/// `russh` client handler: trust on first use.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

#[async_trait]
impl ShellTransport for SshTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Box<dyn ShellSession>, ExecError> {
        let connection_error = |reason: String| ExecError::Connection {
            host: host.to_string(),
            reason,
        };

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        });

        let mut handle = client::connect(config, (host, port), AcceptAnyHostKey)
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        let authenticated = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(connection_error(format!("password rejected for {user}")));
        }

        debug!(host, port, user, "SSH session established");
        Ok(Box::new(SshSession { host: host.to_string(), handle: Some(handle) }))
    }
}

struct SshSession {
    host: String,
    handle: Option<Handle<AcceptAnyHostKey>>,
}

#[async_trait]
impl ShellSession for SshSession {
    async fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, ExecError> {
        let host = self.host.clone();
        let connection_error = |reason: String| ExecError::Connection { host: host.clone(), reason };

        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| connection_error("session already closed".to_string()))?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| connection_error(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| connection_error(e.to_string()))?;
        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| connection_error(e.to_string()))?;
            channel
                .eof()
                .await
                .map_err(|e| connection_error(e.to_string()))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                // Extended data type 1 is stderr.
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                warn!(host = %self.host, error = %e, "SSH disconnect failed");
            }
        }
    }
}
