//! Creates the end-user account inside a freshly booted guest.
//!
//! Templates ship a bootstrap account with passwordless sudo. Once the
//! guest's SSH service accepts that account, it is used to create the real
//! user, set its password, optionally add it to `sudo`, and verify it.
//!
//! ```text
//! validate name ─► wait TCP :22 ─► wait login ─► sudo -n true
//!     ─► useradd (if missing) ─► chpasswd < user:pass ─► usermod -aG sudo ─► getent passwd
//! ```
//!
//! Steps run strictly in order and the first failure aborts the run. Nothing
//! already done is undone.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use crate::poll::poll_until;
use crate::shell::{ExecError, RemoteExecutor, shell_quote, sudo_wrap};

pub const SHELL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Username and password for one guest account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub user: String,
    pub password: String,
}

impl Login {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self { user: user.into(), password: password.into() }
    }
}

/// A remote step of the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    SudoCheck,
    CreateAccount,
    SetPassword,
    GrantSudo,
    VerifyAccount,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapStep::SudoCheck => "passwordless sudo check",
            BootstrapStep::CreateAccount => "account creation",
            BootstrapStep::SetPassword => "password change",
            BootstrapStep::GrantSudo => "sudo group membership",
            BootstrapStep::VerifyAccount => "account verification",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid username {0:?}: only ASCII letters and digits are allowed")]
    InvalidUsername(String),

    #[error("SSH port on {host} not reachable within {timeout:?}")]
    Unreachable { host: String, timeout: Duration },

    #[error("SSH login on {host} not available within {timeout:?} (last error: {last})")]
    HandshakeTimeout { host: String, timeout: Duration, last: String },

    #[error("{step} failed")]
    Step {
        step: BootstrapStep,
        #[source]
        source: ExecError,
    },
}

/// `useradd` accepts far more than this, but alphanumeric names never need
/// quoting and can't collide with option syntax.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub struct GuestBootstrapper<'a> {
    executor: RemoteExecutor<'a>,
    command_timeout: Duration,
}

impl<'a> GuestBootstrapper<'a> {
    pub fn new(executor: RemoteExecutor<'a>, command_timeout: Duration) -> Self {
        Self { executor, command_timeout }
    }

    /// Create `account` on `host` using the `bootstrap` login.
    ///
    /// `timeout` bounds the port wait and, separately, the login wait. The
    /// account commands are bounded by the per-command timeout.
    pub async fn create_user(
        &self,
        host: &str,
        bootstrap: &Login,
        account: &Login,
        make_sudo: bool,
        timeout: Duration,
    ) -> Result<(), BootstrapError> {
        if !is_valid_username(&account.user) {
            return Err(BootstrapError::InvalidUsername(account.user.clone()));
        }

        self.wait_port(host, timeout).await?;
        self.wait_login(host, bootstrap, timeout).await?;

        let user = shell_quote(&account.user);

        self.run(host, bootstrap, BootstrapStep::SudoCheck, "sudo -n true".to_string())
            .await?;

        self.run(
            host,
            bootstrap,
            BootstrapStep::CreateAccount,
            sudo_wrap(&format!("id -u {user} >/dev/null 2>&1 || useradd -m -s /bin/bash {user}")),
        )
        .await?;

        // The password travels on stdin so it never shows up in `ps`.
        let line = format!("{}:{}\n", account.user, account.password);
        self.run_with_input(
            host,
            bootstrap,
            BootstrapStep::SetPassword,
            sudo_wrap("chpasswd"),
            Some(line.as_bytes()),
        )
        .await?;

        if make_sudo {
            self.run(
                host,
                bootstrap,
                BootstrapStep::GrantSudo,
                sudo_wrap(&format!(
                    "getent group sudo >/dev/null 2>&1 || exit 0; usermod -aG sudo {user}"
                )),
            )
            .await?;
        }

        self.run(
            host,
            bootstrap,
            BootstrapStep::VerifyAccount,
            sudo_wrap(&format!("getent passwd {user}")),
        )
        .await?;

        info!(host, user = %account.user, make_sudo, "Guest account ready");
        Ok(())
    }

    async fn wait_port(&self, host: &str, timeout: Duration) -> Result<(), BootstrapError> {
        let transport = self.executor.transport();
        let port = self.executor.port();

        poll_until(SHELL_POLL_INTERVAL, timeout, move || async move {
            transport.probe(host, port).await.then_some(())
        })
        .await
        .map_err(|_| BootstrapError::Unreachable { host: host.to_string(), timeout })
    }

    /// An open port is not enough: sshd may still be generating host keys
    /// or PAM may not be ready, so retry a full login until one succeeds.
    async fn wait_login(
        &self,
        host: &str,
        login: &Login,
        timeout: Duration,
    ) -> Result<(), BootstrapError> {
        let last: Mutex<Option<ExecError>> = Mutex::new(None);
        let last_ref = &last;
        let executor = self.executor;
        let command_timeout = self.command_timeout;

        let result = poll_until(SHELL_POLL_INTERVAL, timeout, move || async move {
            match executor
                .exec(host, &login.user, &login.password, "true", command_timeout)
                .await
            {
                Ok(_) => Some(()),
                Err(e) => {
                    debug!(host, error = %e, "SSH login not ready");
                    if let Ok(mut slot) = last_ref.lock() {
                        *slot = Some(e);
                    }
                    None
                }
            }
        })
        .await;

        result.map_err(|_| {
            let last = last
                .into_inner()
                .ok()
                .flatten()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string());
            BootstrapError::HandshakeTimeout { host: host.to_string(), timeout, last }
        })
    }

    async fn run(
        &self,
        host: &str,
        login: &Login,
        step: BootstrapStep,
        command: String,
    ) -> Result<String, BootstrapError> {
        self.run_with_input(host, login, step, command, None).await
    }

    async fn run_with_input(
        &self,
        host: &str,
        login: &Login,
        step: BootstrapStep,
        command: String,
        stdin: Option<&[u8]>,
    ) -> Result<String, BootstrapError> {
        debug!(host, %step, "Running bootstrap step");
        self.executor
            .exec_with_input(
                host,
                &login.user,
                &login.password,
                &command,
                stdin,
                self.command_timeout,
            )
            .await
            .map_err(|source| BootstrapError::Step { step, source })
    }
}
