//! Remote state probe: the read-only `inspect` contract and its mutating
//! counterpart.
//!
//! [`remote::RemoteHypervisor`] implements both on top of a [`Transport`];
//! tests substitute in-memory fleets.

pub mod remote;
pub mod transport;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::fleet::HostInventory;
use crate::model::{AttrKey, HypervisorRecord};

pub use remote::RemoteHypervisor;
pub use transport::{SshTransport, Transport, TransportError, Verb};

// ── Errors and outcomes ──────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("{host}: unreachable ({reason})")]
    Unreachable {
        host: String,
        reason: String,
        /// Network hiccups and timeouts may succeed on retry; auth
        /// failures will not.
        transient: bool,
    },

    #[error("{host}: required tool '{tool}' is missing")]
    ToolMissing { host: String, tool: String },

    #[error("{host}: unexpected output: {message}")]
    Protocol { host: String, message: String },

    #[error("{host}: {message} (retry with --force)")]
    SoftFailure { host: String, message: String },

    #[error("{host}: VM '{vm}' not found")]
    NotFound { host: String, vm: String },

    #[error("{host}: {message}")]
    Remote { host: String, message: String },
}

impl ProbeError {
    pub fn host(&self) -> &str {
        match self {
            ProbeError::Unreachable { host, .. }
            | ProbeError::ToolMissing { host, .. }
            | ProbeError::Protocol { host, .. }
            | ProbeError::SoftFailure { host, .. }
            | ProbeError::NotFound { host, .. }
            | ProbeError::Remote { host, .. } => host,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProbeError::Unreachable { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Unreachable { transient: true, .. })
    }

    pub fn timeout(host: &str) -> Self {
        ProbeError::Unreachable {
            host: host.to_string(),
            reason: "timed out".into(),
            transient: true,
        }
    }
}

/// What a mutating call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Done,
    /// The target was already gone; nothing to do.
    AlreadyAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    On,
    Off,
    Reboot,
}

impl PowerOp {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerOp::On => "on",
            PowerOp::Off => "off",
            PowerOp::Reboot => "reboot",
        }
    }
}

impl fmt::Display for PowerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an attribute write takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAt {
    Live,
    NextBoot,
}

impl ApplyAt {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyAt::Live => "live",
            ApplyAt::NextBoot => "next-boot",
        }
    }
}

// ── Contracts ────────────────────────────────────────────

#[allow(async_fn_in_trait)] // implementations are crate-internal and test doubles
pub trait Probe {
    /// Report the VMs and assets on `host`. Never mutates remote state.
    async fn inspect(&self, host: &HypervisorRecord) -> Result<HostInventory, ProbeError>;
}

/// Mutating counterpart of [`Probe`]. `force` escalates soft failures
/// (guest tools not answering) to hard operations.
#[allow(async_fn_in_trait)]
pub trait Control {
    async fn create_vm(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        attributes: &BTreeMap<AttrKey, String>,
    ) -> Result<Mutation, ProbeError>;

    async fn destroy_vm(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        force: bool,
    ) -> Result<Mutation, ProbeError>;

    /// Write one attribute. An empty `value` clears it.
    async fn set_attribute(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        key: AttrKey,
        value: &str,
        at: ApplyAt,
        force: bool,
    ) -> Result<Mutation, ProbeError>;

    async fn power(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        op: PowerOp,
        force: bool,
    ) -> Result<Mutation, ProbeError>;

    async fn upload_asset(
        &self,
        host: &HypervisorRecord,
        asset: &str,
        local: &Path,
    ) -> Result<Mutation, ProbeError>;

    async fn remove_asset(
        &self,
        host: &HypervisorRecord,
        asset: &str,
    ) -> Result<Mutation, ProbeError>;
}
