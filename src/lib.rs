//! vm-portal: self-service VM provisioning.
//!
//! Users submit requests for a VM tier; once an administrator approves one,
//! [`orchestrator::Provisioner`] clones a template on the hypervisor, sizes
//! and boots the guest, finds its address, and creates the user's account in
//! it over SSH. The resulting credentials are kept in the request store.

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod hypervisor;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod password;
pub mod paths;
pub mod poll;
pub mod shell;
pub mod store;
pub mod task_waiter;
