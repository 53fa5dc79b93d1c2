//! Scripted collaborators shared by the integration tests.
//!
//! - `FakeHypervisor`: records every call and replays scripted task statuses
//!   and interface lists. The last scripted entry repeats forever.
//! - `FakeTransport`: a tiny in-memory "guest" that understands the account
//!   commands the bootstrapper sends, so runs can be checked by looking at
//!   the resulting users instead of at command strings.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use vm_portal::config::PortalConfig;
use vm_portal::hypervisor::{
    GuestInterface, GuestResources, HypervisorClient, HypervisorError, TaskStatus,
};
use vm_portal::model::{GuestId, TaskHandle};
use vm_portal::orchestrator::Provisioner;
use vm_portal::shell::{CommandOutput, ExecError, ShellSession, ShellTransport};
use vm_portal::store::JsonStore;

pub const FIRST_GUEST_ID: u32 = 105;
pub const GUEST_IP: &str = "10.0.0.50";

pub const CONFIG: &str = r#"
[hypervisor]
host = "pve.test"
user = "portal@pve"
token_name = "provision"
token_value = "secret"
node = "pve"

[guest]
bootstrap_user = "admin"
bootstrap_password = "bootpw"
template_disk_gb = 8
password_length = 16

[[tiers]]
name = "small"
cores = 2
memory_mb = 1024
disk_gb = 15
template_id = 9000

[[tiers]]
name = "tiny"
cores = 1
memory_mb = 512
disk_gb = 8
template_id = 9001
"#;

pub fn portal_config() -> PortalConfig {
    let config = PortalConfig::from_toml(CONFIG).expect("test config parses");
    config.validate().expect("test config is valid");
    config
}

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

pub fn running() -> TaskStatus {
    TaskStatus { status: "running".to_string(), exitstatus: None }
}

pub fn stopped(code: &str) -> TaskStatus {
    TaskStatus { status: "stopped".to_string(), exitstatus: Some(code.to_string()) }
}

pub fn iface(name: &str, inet: serde_json::Value) -> GuestInterface {
    GuestInterface { name: Some(name.to_string()), inet: Some(inet) }
}

fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }
}

fn http_500(what: &str) -> HypervisorError {
    HypervisorError::Status { status: 500, body: format!("{what} refused") }
}

#[derive(Default)]
struct HvState {
    next_id: u32,
    calls: Vec<String>,
    /// Keyed by task kind: "clone", "resize", "start".
    tasks: HashMap<String, VecDeque<Result<TaskStatus, ()>>>,
    interfaces: VecDeque<Result<Vec<GuestInterface>, ()>>,
    failing_requests: HashSet<String>,
}

pub struct FakeHypervisor {
    state: Mutex<HvState>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let mut state = HvState { next_id: FIRST_GUEST_ID, ..Default::default() };
        state
            .interfaces
            .push_back(Ok(vec![iface("eth0", json!(format!("{GUEST_IP}/24")))]));
        Self { state: Mutex::new(state) }
    }

    fn state(&self) -> MutexGuard<'_, HvState> {
        self.state.lock().expect("hypervisor state poisoned")
    }

    /// Statuses returned for tasks of `kind`; `Err(())` is a failed poll.
    pub fn script_task(&self, kind: &str, script: Vec<Result<TaskStatus, ()>>) {
        self.state().tasks.insert(kind.to_string(), script.into());
    }

    pub fn script_interfaces(&self, script: Vec<Result<Vec<GuestInterface>, ()>>) {
        self.state().interfaces = script.into();
    }

    /// Make the `kind` request itself fail with HTTP 500.
    pub fn fail_request(&self, kind: &str) {
        self.state().failing_requests.insert(kind.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, kind: &str, call: String) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.failing_requests.contains(kind) {
            return Err(http_500(kind));
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn next_guest_id(&self) -> Result<GuestId, HypervisorError> {
        self.record("next_guest_id", "next_guest_id".to_string())?;
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        Ok(GuestId(id))
    }

    async fn clone_guest(
        &self,
        _node: &str,
        template: GuestId,
        new_id: GuestId,
        hostname: &str,
    ) -> Result<TaskHandle, HypervisorError> {
        self.record("clone", format!("clone {template}->{new_id} {hostname}"))?;
        Ok(TaskHandle(format!("UPID:pve:clone:{new_id}")))
    }

    async fn resize_disk(
        &self,
        _node: &str,
        guest: GuestId,
        disk: &str,
        delta: &str,
    ) -> Result<TaskHandle, HypervisorError> {
        self.record("resize", format!("resize {guest} {disk} {delta}"))?;
        Ok(TaskHandle(format!("UPID:pve:resize:{guest}")))
    }

    async fn configure(
        &self,
        _node: &str,
        guest: GuestId,
        config: &GuestResources,
    ) -> Result<(), HypervisorError> {
        self.record(
            "configure",
            format!(
                "configure {guest} cores={} memory={} hostname={}",
                config.cores, config.memory_mb, config.hostname
            ),
        )
    }

    async fn start(&self, _node: &str, guest: GuestId) -> Result<TaskHandle, HypervisorError> {
        self.record("start", format!("start {guest}"))?;
        Ok(TaskHandle(format!("UPID:pve:start:{guest}")))
    }

    async fn task_status(
        &self,
        _node: &str,
        task: &TaskHandle,
    ) -> Result<TaskStatus, HypervisorError> {
        let mut state = self.state();
        state.calls.push(format!("task_status {task}"));
        let kind = task.0.split(':').nth(2).unwrap_or_default().to_string();
        match state.tasks.get_mut(&kind).and_then(next_scripted) {
            None => Ok(stopped("OK")),
            Some(Ok(status)) => Ok(status),
            Some(Err(())) => Err(http_500("task status")),
        }
    }

    async fn interfaces(
        &self,
        _node: &str,
        guest: GuestId,
    ) -> Result<Vec<GuestInterface>, HypervisorError> {
        let mut state = self.state();
        state.calls.push(format!("interfaces {guest}"));
        match next_scripted(&mut state.interfaces) {
            None => Ok(Vec::new()),
            Some(Ok(list)) => Ok(list),
            Some(Err(())) => Err(http_500("interfaces")),
        }
    }
}

// ---------------------------------------------------------------------------
// Guest shell
// ---------------------------------------------------------------------------

pub struct GuestState {
    pub bootstrap_user: String,
    pub bootstrap_password: String,
    /// Account name → password set through `chpasswd`.
    pub users: BTreeMap<String, Option<String>>,
    pub sudoers: BTreeSet<String>,
    pub sudo_ok: bool,
    /// Whether the image has a `sudo` group at all.
    pub has_sudo_group: bool,
    /// Commands containing this text lose their channel mid-exec.
    pub dropped_command: Option<String>,
    pub reachable: bool,
    /// Number of upcoming connects refused before sshd "comes up".
    pub failing_logins: usize,
    pub accounts_created: usize,
    pub probes: usize,
    pub connects: usize,
    pub closes: usize,
    pub commands: Vec<String>,
}

impl GuestState {
    fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> CommandOutput {
        let ok = |stdout: String| CommandOutput { stdout, stderr: String::new(), exit_status: Some(0) };
        let fail = |code: u32, stderr: &str| CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_status: Some(code),
        };

        if command == "true" {
            return ok(String::new());
        }
        if !command.starts_with("sudo -n ") {
            return fail(127, "unsupported command");
        }
        if !self.sudo_ok {
            return fail(1, "sudo: a password is required");
        }
        if command == "sudo -n true" {
            return ok(String::new());
        }

        if let Some((_, rest)) = command.split_once("useradd -m -s /bin/bash ") {
            let user = rest.trim_end_matches('\'').to_string();
            if !self.users.contains_key(&user) {
                self.users.insert(user, None);
                self.accounts_created += 1;
            }
            return ok(String::new());
        }

        if command.ends_with(" chpasswd") {
            let input = String::from_utf8_lossy(stdin.unwrap_or_default()).into_owned();
            let line = input.lines().next().unwrap_or_default();
            return match line.split_once(':') {
                Some((user, password)) if self.users.contains_key(user) => {
                    self.users.insert(user.to_string(), Some(password.to_string()));
                    ok(String::new())
                }
                _ => fail(1, "chpasswd: line 1: user not found"),
            };
        }

        if command.contains("getent group sudo") && !self.has_sudo_group {
            return ok(String::new());
        }

        if let Some((_, rest)) = command.split_once("usermod -aG sudo ") {
            let user = rest.trim_end_matches('\'');
            if !self.users.contains_key(user) {
                return fail(6, "usermod: user does not exist");
            }
            self.sudoers.insert(user.to_string());
            return ok(String::new());
        }

        if let Some((_, rest)) = command.split_once("getent passwd ") {
            let user = rest.trim_end_matches('\'');
            if self.users.contains_key(user) {
                return ok(format!("{user}:x:1001:1001::/home/{user}:/bin/bash\n"));
            }
            return fail(2, "");
        }

        fail(127, "unsupported command")
    }
}

pub struct FakeTransport {
    guest: Arc<Mutex<GuestState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        let mut users = BTreeMap::new();
        users.insert("admin".to_string(), Some("bootpw".to_string()));
        Self {
            guest: Arc::new(Mutex::new(GuestState {
                bootstrap_user: "admin".to_string(),
                bootstrap_password: "bootpw".to_string(),
                users,
                sudoers: BTreeSet::new(),
                sudo_ok: true,
                has_sudo_group: true,
                dropped_command: None,
                reachable: true,
                failing_logins: 0,
                accounts_created: 0,
                probes: 0,
                connects: 0,
                closes: 0,
                commands: Vec::new(),
            })),
        }
    }

    pub fn guest(&self) -> MutexGuard<'_, GuestState> {
        self.guest.lock().expect("guest state poisoned")
    }
}

#[async_trait]
impl ShellTransport for FakeTransport {
    async fn connect(
        &self,
        host: &str,
        _port: u16,
        user: &str,
        password: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn ShellSession>, ExecError> {
        let mut guest = self.guest();
        guest.connects += 1;
        if guest.failing_logins > 0 {
            guest.failing_logins -= 1;
            return Err(ExecError::Connection {
                host: host.to_string(),
                reason: "connection reset by peer".to_string(),
            });
        }
        if user != guest.bootstrap_user || password != guest.bootstrap_password {
            return Err(ExecError::Connection {
                host: host.to_string(),
                reason: format!("password rejected for {user}"),
            });
        }
        Ok(Box::new(FakeSession { guest: Arc::clone(&self.guest) }))
    }

    async fn probe(&self, _host: &str, _port: u16) -> bool {
        let mut guest = self.guest();
        guest.probes += 1;
        guest.reachable
    }
}

struct FakeSession {
    guest: Arc<Mutex<GuestState>>,
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecError> {
        if command.starts_with("sleep") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut guest = self.guest.lock().expect("guest state poisoned");
        guest.commands.push(command.to_string());
        if guest.dropped_command.as_deref().is_some_and(|text| command.contains(text)) {
            return Err(ExecError::Connection {
                host: GUEST_IP.to_string(),
                reason: "channel closed".to_string(),
            });
        }
        Ok(guest.run(command, stdin))
    }

    async fn close(&mut self) {
        self.guest.lock().expect("guest state poisoned").closes += 1;
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub hypervisor: Arc<FakeHypervisor>,
    pub transport: Arc<FakeTransport>,
    pub store: Arc<JsonStore>,
    pub provisioner: Provisioner,
}

impl Harness {
    pub fn new() -> Self {
        let hypervisor = Arc::new(FakeHypervisor::new());
        let transport = Arc::new(FakeTransport::new());
        let store = Arc::new(JsonStore::in_memory());
        let provisioner = Provisioner::new(
            hypervisor.clone(),
            transport.clone(),
            store.clone(),
            Arc::new(portal_config()),
        );
        Self { hypervisor, transport, store, provisioner }
    }
}
