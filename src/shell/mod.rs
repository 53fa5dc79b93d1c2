//! Remote command execution inside guests.
//!
//! Every [`RemoteExecutor::exec`] call opens its own authenticated session,
//! runs exactly one command, and closes the session again, whatever the
//! outcome. There is no pooling: a guest that is still booting cannot poison
//! a cached connection.
//!
//! The transport is a trait so the bootstrapper can be driven by a scripted
//! fake in tests; [`ssh::SshTransport`] is the real implementation.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

pub mod ssh;

pub use ssh::SshTransport;

pub const SSH_PORT: u16 = 22;

/// Timeout of a single TCP reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("remote command exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<u32>, stderr: String },

    #[error("remote command on {host} did not finish within {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without reporting one.
    pub exit_status: Option<u32>,
}

/// An open, authenticated shell session.
#[async_trait]
pub trait ShellSession: Send {
    /// Run `command`. `stdin`, when given, is written to the command's
    /// standard input followed by end-of-file.
    async fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, ExecError>;

    /// Release the session. Must be safe to call after a failed `exec`.
    async fn close(&mut self);
}

#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Connect and authenticate with a password. Unknown host keys are
    /// accepted (trust on first use).
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Box<dyn ShellSession>, ExecError>;

    /// Whether `host:port` accepts TCP connections right now.
    async fn probe(&self, host: &str, port: u16) -> bool {
        let connect = tokio::net::TcpStream::connect((host, port));
        matches!(tokio::time::timeout(PROBE_TIMEOUT, connect).await, Ok(Ok(_)))
    }
}

/// Runs single commands over fresh sessions from a [`ShellTransport`].
#[derive(Clone, Copy)]
pub struct RemoteExecutor<'a> {
    transport: &'a dyn ShellTransport,
    port: u16,
}

impl<'a> RemoteExecutor<'a> {
    pub fn new(transport: &'a dyn ShellTransport) -> Self {
        Self { transport, port: SSH_PORT }
    }

    pub fn transport(&self) -> &'a dyn ShellTransport {
        self.transport
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run `command` as `user` on `host` and return its trimmed stdout.
    ///
    /// A non-zero or missing exit status is [`ExecError::CommandFailed`].
    /// `timeout` bounds connect, authentication and execution together.
    pub async fn exec(
        &self,
        host: &str,
        user: &str,
        password: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        self.exec_with_input(host, user, password, command, None, timeout).await
    }

    /// [`RemoteExecutor::exec`] feeding `stdin` to the command. Secrets
    /// passed this way never appear in the remote process list.
    pub async fn exec_with_input(
        &self,
        host: &str,
        user: &str,
        password: &str,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let run = async {
            let mut session = self
                .transport
                .connect(host, self.port, user, password, timeout)
                .await?;
            let result = session.exec(command, stdin).await;
            session.close().await;
            result
        };

        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ExecError::Timeout { host: host.to_string(), timeout })??;

        debug!(host, user, exit_status = ?output.exit_status, "Remote command finished");

        match output.exit_status {
            Some(0) => Ok(output.stdout.trim().to_string()),
            code => Err(ExecError::CommandFailed { code, stderr: output.stderr.trim().to_string() }),
        }
    }
}

/// Quote `s` for a POSIX shell as a single-quoted word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Wrap `command` so it runs as root through passwordless sudo.
///
/// `sudo -n` fails immediately instead of prompting when the account is not
/// allowed to elevate without a password; `bash -lc` keeps pipes and
/// redirections inside the elevated shell.
pub fn sudo_wrap(command: &str) -> String {
    format!("sudo -n bash -lc {}", shell_quote(command))
}
