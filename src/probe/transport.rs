//! Command transport to a hypervisor.
//!
//! Every hypervisor verb is a call to a remote helper command:
//! `<helper> <verb> <args…>`. [`SshTransport`] reaches the helper over
//! `ssh` in batch mode; file uploads stream the local file into the
//! helper's stdin.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;

use crate::model::HypervisorRecord;
use crate::util::shell_quote;

/// Exit status the helper uses when the named VM or asset does not exist.
pub const EXIT_NOT_FOUND: i32 = 4;
/// Exit status for soft failures, e.g. guest tools not answering a
/// graceful shutdown.
pub const EXIT_SOFT_FAILURE: i32 = 3;
/// Shell status for "command not found".
pub const EXIT_TOOL_MISSING: i32 = 127;
/// `ssh` itself failed (connection or authentication).
const EXIT_SSH_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("remote command exited with {code}: {stderr}")]
    Remote { code: i32, stderr: String },

    #[error("timed out")]
    Timeout,
}

/// A hypervisor verb understood by the remote helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    /// Tab-separated inventory of VMs and assets.
    Inventory,
    Create {
        vm: String,
        attributes: Vec<(String, String)>,
    },
    Destroy {
        vm: String,
    },
    Set {
        vm: String,
        key: String,
        value: String,
        at: &'static str,
        force: bool,
    },
    Unset {
        vm: String,
        key: String,
        at: &'static str,
    },
    /// `on`, `off`, `off-hard`, `reboot` or `reset`.
    Power {
        vm: String,
        op: &'static str,
    },
    /// Reads the asset body from stdin.
    Upload {
        asset: String,
    },
    RemoveAsset {
        asset: String,
    },
}

impl Verb {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Inventory => "inventory",
            Verb::Create { .. } => "create",
            Verb::Destroy { .. } => "destroy",
            Verb::Set { .. } => "set",
            Verb::Unset { .. } => "unset",
            Verb::Power { .. } => "power",
            Verb::Upload { .. } => "upload",
            Verb::RemoveAsset { .. } => "remove-asset",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            Verb::Inventory => Vec::new(),
            Verb::Create { vm, attributes } => {
                let mut args = vec![vm.clone()];
                args.extend(attributes.iter().map(|(k, v)| format!("{k}={v}")));
                args
            }
            Verb::Destroy { vm } => vec![vm.clone()],
            Verb::Set {
                vm,
                key,
                value,
                at,
                force,
            } => {
                let mut args = vec![vm.clone(), key.clone(), value.clone(), at.to_string()];
                if *force {
                    args.push("--force".into());
                }
                args
            }
            Verb::Unset { vm, key, at } => vec![vm.clone(), key.clone(), at.to_string()],
            Verb::Power { vm, op } => vec![vm.clone(), op.to_string()],
            Verb::Upload { asset } | Verb::RemoveAsset { asset } => vec![asset.clone()],
        }
    }

    /// The full remote command line, quoted for the remote shell.
    pub fn command_line(&self, helper: &str) -> String {
        let mut parts = vec![shell_quote(helper), self.name().to_string()];
        parts.extend(self.args().iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

#[allow(async_fn_in_trait)] // implementations are crate-internal and test doubles
pub trait Transport {
    /// Run `verb` on `host`, returning its stdout.
    async fn exec(&self, host: &HypervisorRecord, verb: &Verb) -> Result<String, TransportError>;

    /// Upload the local file at `local` as asset `asset`.
    async fn copy(
        &self,
        host: &HypervisorRecord,
        local: &Path,
        asset: &str,
    ) -> Result<(), TransportError>;
}

// ── ssh ──────────────────────────────────────────────────

pub struct SshTransport {
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn command(&self, host: &HypervisorRecord, verb: &Verb) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if let Some(identity) = &host.credentials.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", host.credentials.user, host.address))
            .arg("--")
            .arg(verb.command_line(&host.credentials.remote_command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        mut cmd: tokio::process::Command,
        host: &HypervisorRecord,
        verb: &Verb,
    ) -> Result<String, TransportError> {
        tracing::debug!(host = %host.name, verb = verb.name(), "ssh exec");
        let output = cmd
            .output()
            .await
            .map_err(|e| TransportError::Network(format!("cannot run ssh: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(EXIT_SSH_FAILURE) => Err(classify_ssh_failure(stderr)),
            Some(code) => Err(TransportError::Remote { code, stderr }),
            None => Err(TransportError::Network(format!(
                "ssh terminated by signal: {stderr}"
            ))),
        }
    }
}

impl Transport for SshTransport {
    async fn exec(&self, host: &HypervisorRecord, verb: &Verb) -> Result<String, TransportError> {
        let mut cmd = self.command(host, verb);
        cmd.stdin(Stdio::null());
        self.run(cmd, host, verb).await
    }

    async fn copy(
        &self,
        host: &HypervisorRecord,
        local: &Path,
        asset: &str,
    ) -> Result<(), TransportError> {
        let file = std::fs::File::open(local).map_err(|e| TransportError::Remote {
            code: 1,
            stderr: format!("cannot open {}: {e}", local.display()),
        })?;
        let verb = Verb::Upload {
            asset: asset.to_string(),
        };
        let mut cmd = self.command(host, &verb);
        cmd.stdin(Stdio::from(file));
        self.run(cmd, host, &verb).await.map(|_| ())
    }
}

fn classify_ssh_failure(stderr: String) -> TransportError {
    if stderr.contains("Permission denied") || stderr.contains("Host key verification failed") {
        TransportError::Auth(stderr)
    } else {
        TransportError::Network(stderr)
    }
}
