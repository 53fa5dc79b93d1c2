//! Request and credential persistence.
//!
//! [`ProvisioningStore`] is the persistence collaborator of the provisioner
//! and of the CLI. Every operation is a transaction: readers see a request's
//! READY status and its credentials together or not at all, and a failed
//! write leaves the store exactly as it was.
//!
//! [`JsonStore`] has two backends:
//!
//! - in memory: one mutex around the state; a change is applied to a copy
//!   and swapped in only when it succeeds.
//! - on a JSON file: nothing is cached. Each operation takes an advisory lock
//!   on `<file>.lock` (shared for reads, exclusive for writes), loads the
//!   file, and for writes replaces it through `<file>.tmp` + rename before
//!   unlocking. Several processes can share one file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{GuestCredentials, ProvisioningRequest, RequestId, RequestStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request {0} not found")]
    NotFound(RequestId),

    #[error("request {id} is {status}, not PENDING")]
    NotPending { id: RequestId, status: RequestStatus },

    #[error("request {0} is already being provisioned")]
    AlreadyClaimed(RequestId),

    #[error("credentials for request {0} do not belong to it")]
    CredentialsMismatch(RequestId),

    #[error("store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store worker failed: {0}")]
    Worker(String),
}

#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    /// Record a new PENDING request.
    async fn submit(&self, username: &str, tier: &str) -> Result<ProvisioningRequest, StoreError>;

    async fn get(&self, id: RequestId) -> Result<ProvisioningRequest, StoreError>;

    /// All requests, newest first.
    async fn list(&self) -> Result<Vec<ProvisioningRequest>, StoreError>;

    /// Administrator decision: PENDING → REJECTED.
    async fn reject(&self, id: RequestId) -> Result<(), StoreError>;

    /// Take a PENDING request for provisioning. At most one claim succeeds
    /// per request; later ones get [`StoreError::AlreadyClaimed`].
    async fn claim(&self, id: RequestId) -> Result<ProvisioningRequest, StoreError>;

    /// PENDING → READY together with the credential upsert.
    async fn mark_ready(&self, id: RequestId, credentials: GuestCredentials) -> Result<(), StoreError>;

    /// PENDING → FAILED with the failure cause.
    async fn mark_failed(&self, id: RequestId, reason: &str) -> Result<(), StoreError>;

    async fn credentials(&self, id: RequestId) -> Result<Option<GuestCredentials>, StoreError>;

    /// Credentials of every READY request of `username`, newest first.
    async fn credentials_for_user(&self, username: &str) -> Result<Vec<GuestCredentials>, StoreError>;
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    requests: BTreeMap<RequestId, ProvisioningRequest>,
    credentials: BTreeMap<RequestId, GuestCredentials>,
}

impl StoreState {
    fn pending_mut(&mut self, id: RequestId) -> Result<&mut ProvisioningRequest, StoreError> {
        let request = self.requests.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if request.status.is_terminal() {
            return Err(StoreError::NotPending { id, status: request.status });
        }
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// `store.json` → `store.json.<suffix>`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// Advisory lock on `<store>.lock`, released on drop.
struct FileLock(File);

impl FileLock {
    fn acquire(store: &Path, exclusive: bool) -> Result<Self, StoreError> {
        if let Some(parent) = store.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let lock_path = sidecar(store, "lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(io_error(&lock_path))?;
        Ok(Self(file))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn load(path: &Path) -> Result<StoreState, StoreError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Corrupt { path: path.to_path_buf(), source }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
        Err(source) => Err(StoreError::Io { path: path.to_path_buf(), source }),
    }
}

fn save(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|source| StoreError::Corrupt { path: path.to_path_buf(), source })?;
    let tmp = sidecar(path, "tmp");
    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

async fn blocking<R, F>(job: F) -> Result<R, StoreError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
}

// ---------------------------------------------------------------------------
// JsonStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Backend {
    Memory(Mutex<StoreState>),
    File(PathBuf),
}

#[derive(Debug)]
pub struct JsonStore {
    backend: Backend,
}

fn lock_state(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JsonStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self { backend: Backend::Memory(Mutex::new(StoreState::default())) }
    }

    /// Use the store file at `path`, which need not exist yet. An unreadable
    /// or corrupt file is reported here rather than on first use.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { backend: Backend::File(path.into()) };
        store.read(|_| Ok(())).await?;
        Ok(store)
    }

    async fn read<R, F>(&self, view: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&StoreState) -> Result<R, StoreError> + Send + 'static,
    {
        match &self.backend {
            Backend::Memory(state) => {
                let current = lock_state(state);
                view(&current)
            }
            Backend::File(path) => {
                let path = path.clone();
                blocking(move || {
                    let _lock = FileLock::acquire(&path, false)?;
                    view(&load(&path)?)
                })
                .await
            }
        }
    }

    async fn write<R, F>(&self, change: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut StoreState) -> Result<R, StoreError> + Send + 'static,
    {
        match &self.backend {
            Backend::Memory(state) => {
                let mut current = lock_state(state);
                let mut next = current.clone();
                let result = change(&mut next)?;
                *current = next;
                Ok(result)
            }
            Backend::File(path) => {
                let path = path.clone();
                blocking(move || {
                    let _lock = FileLock::acquire(&path, true)?;
                    let mut state = load(&path)?;
                    let result = change(&mut state)?;
                    save(&path, &state)?;
                    Ok(result)
                })
                .await
            }
        }
    }
}

#[async_trait]
impl ProvisioningStore for JsonStore {
    async fn submit(&self, username: &str, tier: &str) -> Result<ProvisioningRequest, StoreError> {
        let (user, tier_name) = (username.to_string(), tier.to_string());
        let request = self
            .write(move |state| {
                state.next_id += 1;
                let now = Utc::now();
                let request = ProvisioningRequest {
                    id: RequestId(state.next_id),
                    username: user,
                    tier: tier_name,
                    status: RequestStatus::Pending,
                    created_at: now,
                    updated_at: now,
                    claimed_at: None,
                    failure_reason: None,
                };
                state.requests.insert(request.id, request.clone());
                Ok(request)
            })
            .await?;
        info!(id = %request.id, username, tier, "Request submitted");
        Ok(request)
    }

    async fn get(&self, id: RequestId) -> Result<ProvisioningRequest, StoreError> {
        self.read(move |state| state.requests.get(&id).cloned().ok_or(StoreError::NotFound(id)))
            .await
    }

    async fn list(&self) -> Result<Vec<ProvisioningRequest>, StoreError> {
        self.read(|state| Ok(state.requests.values().rev().cloned().collect()))
            .await
    }

    async fn reject(&self, id: RequestId) -> Result<(), StoreError> {
        self.write(move |state| {
            let request = state.pending_mut(id)?;
            request.status = RequestStatus::Rejected;
            request.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        info!(%id, "Request rejected");
        Ok(())
    }

    async fn claim(&self, id: RequestId) -> Result<ProvisioningRequest, StoreError> {
        self.write(move |state| {
            let request = state.pending_mut(id)?;
            if request.claimed_at.is_some() {
                return Err(StoreError::AlreadyClaimed(id));
            }
            let now = Utc::now();
            request.claimed_at = Some(now);
            request.updated_at = now;
            Ok(request.clone())
        })
        .await
    }

    async fn mark_ready(&self, id: RequestId, credentials: GuestCredentials) -> Result<(), StoreError> {
        if credentials.request_id != id {
            return Err(StoreError::CredentialsMismatch(id));
        }
        self.write(move |state| {
            let request = state.pending_mut(id)?;
            request.status = RequestStatus::Ready;
            request.updated_at = Utc::now();
            state.credentials.insert(id, credentials);
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: RequestId, reason: &str) -> Result<(), StoreError> {
        let reason = reason.to_string();
        self.write(move |state| {
            let request = state.pending_mut(id)?;
            request.status = RequestStatus::Failed;
            request.updated_at = Utc::now();
            request.failure_reason = Some(reason);
            Ok(())
        })
        .await
    }

    async fn credentials(&self, id: RequestId) -> Result<Option<GuestCredentials>, StoreError> {
        self.read(move |state| Ok(state.credentials.get(&id).cloned())).await
    }

    async fn credentials_for_user(&self, username: &str) -> Result<Vec<GuestCredentials>, StoreError> {
        let username = username.to_string();
        self.read(move |state| {
            let mut found: Vec<GuestCredentials> = state
                .requests
                .values()
                .filter(|r| r.username == username && r.status == RequestStatus::Ready)
                .filter_map(|r| state.credentials.get(&r.id).cloned())
                .collect();
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(found)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn creds(id: RequestId) -> GuestCredentials {
        GuestCredentials {
            request_id: id,
            hostname: format!("vm-alice-{}", 100 + id.0),
            ip_address: Ipv4Addr::new(10, 0, 0, 7),
            username: "alice".to_string(),
            password: "Secr3t!Secr3t!".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_assigns_increasing_ids() {
        let store = JsonStore::in_memory();
        let a = store.submit("alice", "small").await.unwrap();
        let b = store.submit("bob", "large").await.unwrap();
        assert_eq!(a.id, RequestId(1));
        assert_eq!(b.id, RequestId(2));
        assert_eq!(a.status, RequestStatus::Pending);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn ready_stores_credentials_once() {
        let store = JsonStore::in_memory();
        let req = store.submit("alice", "small").await.unwrap();
        store.mark_ready(req.id, creds(req.id)).await.unwrap();

        assert_eq!(store.get(req.id).await.unwrap().status, RequestStatus::Ready);
        let stored = store.credentials(req.id).await.unwrap().expect("credentials");
        assert_eq!(stored.hostname, "vm-alice-101");
        assert_eq!(stored.password, "Secr3t!Secr3t!");

        let again = store.mark_ready(req.id, creds(req.id)).await;
        assert!(matches!(again, Err(StoreError::NotPending { status: RequestStatus::Ready, .. })));
        assert_eq!(store.credentials_for_user("alice").await.unwrap().len(), 1);
        assert!(store.credentials_for_user("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let store = JsonStore::in_memory();
        let req = store.submit("alice", "small").await.unwrap();
        store.reject(req.id).await.unwrap();

        assert!(matches!(
            store.mark_failed(req.id, "boom").await,
            Err(StoreError::NotPending { status: RequestStatus::Rejected, .. })
        ));
        assert!(store.reject(req.id).await.is_err());
        assert!(store.claim(req.id).await.is_err());
        assert!(store.mark_ready(req.id, creds(req.id)).await.is_err());
        assert_eq!(store.credentials(req.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = JsonStore::in_memory();
        let req = store.submit("alice", "small").await.unwrap();

        let claimed = store.claim(req.id).await.unwrap();
        assert_eq!(claimed.status, RequestStatus::Pending);
        assert!(claimed.claimed_at.is_some());
        assert!(matches!(store.claim(req.id).await, Err(StoreError::AlreadyClaimed(_))));

        // A claimed request can still be finished.
        store.mark_failed(req.id, "start did not complete").await.unwrap();
        assert_eq!(store.get(req.id).await.unwrap().status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn failure_keeps_reason_and_no_credentials() {
        let store = JsonStore::in_memory();
        let req = store.submit("alice", "small").await.unwrap();
        store.mark_failed(req.id, "clone task failed: ERROR").await.unwrap();

        let failed = store.get(req.id).await.unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("clone task failed: ERROR"));
        assert_eq!(store.credentials(req.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn mismatched_credentials_are_refused() {
        let store = JsonStore::in_memory();
        let req = store.submit("alice", "small").await.unwrap();
        let result = store.mark_ready(req.id, creds(RequestId(99))).await;
        assert!(matches!(result, Err(StoreError::CredentialsMismatch(_))));
        assert_eq!(store.get(req.id).await.unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_request() {
        let store = JsonStore::in_memory();
        assert!(matches!(store.get(RequestId(7)).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.reject(RequestId(7)).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");

        {
            let store = JsonStore::open(&path).await.unwrap();
            let ready = store.submit("alice", "small").await.unwrap();
            let rejected = store.submit("bob", "small").await.unwrap();
            store.mark_ready(ready.id, creds(ready.id)).await.unwrap();
            store.reject(rejected.id).await.unwrap();
        }

        let store = JsonStore::open(&path).await.unwrap();
        assert_eq!(store.get(RequestId(1)).await.unwrap().status, RequestStatus::Ready);
        assert_eq!(store.get(RequestId(2)).await.unwrap().status, RequestStatus::Rejected);
        let stored = store.credentials(RequestId(1)).await.unwrap().expect("credentials");
        assert_eq!(stored.ip_address, Ipv4Addr::new(10, 0, 0, 7));

        let next = store.submit("carol", "small").await.unwrap();
        assert_eq!(next.id, RequestId(3));
    }

    #[tokio::test]
    async fn handles_on_one_file_see_each_others_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let first = JsonStore::open(&path).await.unwrap();
        let second = JsonStore::open(&path).await.unwrap();

        let alice = first.submit("alice", "small").await.unwrap();
        let bob = second.submit("bob", "small").await.unwrap();
        assert_eq!((alice.id, bob.id), (RequestId(1), RequestId(2)));

        second.reject(alice.id).await.unwrap();
        assert_eq!(first.get(alice.id).await.unwrap().status, RequestStatus::Rejected);

        first.claim(bob.id).await.unwrap();
        assert!(matches!(second.claim(bob.id).await, Err(StoreError::AlreadyClaimed(_))));

        let reopened = JsonStore::open(&path).await.unwrap();
        let users: Vec<String> = reopened.list().await.unwrap().into_iter().map(|r| r.username).collect();
        assert_eq!(users, vec!["bob".to_string(), "alice".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_submits_on_one_file_get_distinct_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let first = JsonStore::open(&path).await.unwrap();
        let second = JsonStore::open(&path).await.unwrap();

        let (a, b) = tokio::join!(first.submit("alice", "small"), second.submit("bob", "small"));
        assert_ne!(a.unwrap().id, b.unwrap().id);
        assert_eq!(first.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        let store = JsonStore::open(&path).await.unwrap();
        let req = store.submit("alice", "small").await.unwrap();

        // The replacement file cannot be written while a directory holds its name.
        let tmp = sidecar(&path, "tmp");
        std::fs::create_dir(&tmp).unwrap();
        let result = store.mark_ready(req.id, creds(req.id)).await;
        assert!(matches!(result, Err(StoreError::Io { .. })), "{result:?}");
        std::fs::remove_dir(&tmp).unwrap();

        assert_eq!(store.get(req.id).await.unwrap().status, RequestStatus::Pending);
        assert_eq!(store.credentials(req.id).await.unwrap(), None);
        assert_eq!(store.submit("bob", "small").await.unwrap().id, RequestId(2));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(JsonStore::open(&path).await, Err(StoreError::Corrupt { .. })));
    }
}
