//! Probe and control over a [`Transport`], speaking the helper's
//! line protocol.
//!
//! `inventory` prints one tab-separated record per line:
//!
//! ```text
//! vm        <name> <power>
//! attr      <vm>   <key>   <value>
//! pending   <vm>   <key>   <value>
//! attached  <vm>   <asset> <checksum or ->
//! asset     <name> <checksum>
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use crate::fleet::{ActualVm, AttachedAsset, HostInventory, PowerState};
use crate::model::{AttrKey, HypervisorRecord};

use super::transport::{EXIT_NOT_FOUND, EXIT_SOFT_FAILURE, EXIT_TOOL_MISSING};
use super::{ApplyAt, Control, Mutation, PowerOp, Probe, ProbeError, Transport, TransportError, Verb};

pub struct RemoteHypervisor<T> {
    transport: T,
}

impl<T: Transport> RemoteHypervisor<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn exec(&self, host: &HypervisorRecord, verb: &Verb) -> Result<String, ProbeError> {
        self.transport
            .exec(host, verb)
            .await
            .map_err(|e| classify(host, e))
    }

    /// Run `verb`, treating "not found" as already absent.
    async fn exec_absent_ok(
        &self,
        host: &HypervisorRecord,
        verb: &Verb,
    ) -> Result<Mutation, ProbeError> {
        match self.transport.exec(host, verb).await {
            Ok(_) => Ok(Mutation::Done),
            Err(TransportError::Remote {
                code: EXIT_NOT_FOUND,
                ..
            }) => Ok(Mutation::AlreadyAbsent),
            Err(e) => Err(classify(host, e)),
        }
    }

    /// Run a power verb, escalating to `hard_op` on a soft failure when
    /// forced.
    async fn power_with_fallback(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        op: &'static str,
        hard_op: Option<&'static str>,
        force: bool,
    ) -> Result<Mutation, ProbeError> {
        let verb = Verb::Power {
            vm: vm.to_string(),
            op,
        };
        let err = match self.exec(host, &verb).await {
            Ok(_) => return Ok(Mutation::Done),
            Err(e) => not_found_as_vm(e, vm),
        };
        match (err, hard_op) {
            (ProbeError::SoftFailure { message, .. }, Some(hard)) if force => {
                tracing::warn!(host = %host.name, vm, op, hard, %message, "escalating to hard power operation");
                let verb = Verb::Power {
                    vm: vm.to_string(),
                    op: hard,
                };
                self.exec(host, &verb)
                    .await
                    .map(|_| Mutation::Done)
                    .map_err(|e| not_found_as_vm(e, vm))
            }
            (err, _) => Err(err),
        }
    }
}

impl<T: Transport> Probe for RemoteHypervisor<T> {
    async fn inspect(&self, host: &HypervisorRecord) -> Result<HostInventory, ProbeError> {
        let output = self.exec(host, &Verb::Inventory).await?;
        parse_inventory(&host.name, &output).map_err(|message| ProbeError::Protocol {
            host: host.name.clone(),
            message,
        })
    }
}

impl<T: Transport> Control for RemoteHypervisor<T> {
    async fn create_vm(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        attributes: &BTreeMap<AttrKey, String>,
    ) -> Result<Mutation, ProbeError> {
        let verb = Verb::Create {
            vm: vm.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect(),
        };
        self.exec(host, &verb).await.map(|_| Mutation::Done)
    }

    async fn destroy_vm(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        force: bool,
    ) -> Result<Mutation, ProbeError> {
        match self
            .power_with_fallback(host, vm, "off", Some("off-hard"), force)
            .await
        {
            Ok(_) => {}
            Err(ProbeError::NotFound { .. }) => return Ok(Mutation::AlreadyAbsent),
            Err(e) => return Err(e),
        }
        self.exec_absent_ok(host, &Verb::Destroy { vm: vm.to_string() })
            .await
    }

    async fn set_attribute(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        key: AttrKey,
        value: &str,
        at: ApplyAt,
        force: bool,
    ) -> Result<Mutation, ProbeError> {
        let verb = if value.is_empty() {
            Verb::Unset {
                vm: vm.to_string(),
                key: key.as_str().to_string(),
                at: at.as_str(),
            }
        } else {
            Verb::Set {
                vm: vm.to_string(),
                key: key.as_str().to_string(),
                value: value.to_string(),
                at: at.as_str(),
                force: force && at == ApplyAt::Live,
            }
        };
        self.exec(host, &verb)
            .await
            .map(|_| Mutation::Done)
            .map_err(|e| not_found_as_vm(e, vm))
    }

    async fn power(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        op: PowerOp,
        force: bool,
    ) -> Result<Mutation, ProbeError> {
        match op {
            PowerOp::On => self.power_with_fallback(host, vm, "on", None, force).await,
            PowerOp::Off => {
                self.power_with_fallback(host, vm, "off", Some("off-hard"), force)
                    .await
            }
            PowerOp::Reboot => {
                self.power_with_fallback(host, vm, "reboot", Some("reset"), force)
                    .await
            }
        }
    }

    async fn upload_asset(
        &self,
        host: &HypervisorRecord,
        asset: &str,
        local: &Path,
    ) -> Result<Mutation, ProbeError> {
        self.transport
            .copy(host, local, asset)
            .await
            .map(|_| Mutation::Done)
            .map_err(|e| classify(host, e))
    }

    async fn remove_asset(
        &self,
        host: &HypervisorRecord,
        asset: &str,
    ) -> Result<Mutation, ProbeError> {
        self.exec_absent_ok(
            host,
            &Verb::RemoveAsset {
                asset: asset.to_string(),
            },
        )
        .await
    }
}

// ── Error mapping ────────────────────────────────────────

fn classify(host: &HypervisorRecord, err: TransportError) -> ProbeError {
    let name = host.name.clone();
    match err {
        TransportError::Auth(reason) => ProbeError::Unreachable {
            host: name,
            reason: format!("authentication failed: {reason}"),
            transient: false,
        },
        TransportError::Network(reason) => ProbeError::Unreachable {
            host: name,
            reason,
            transient: true,
        },
        TransportError::Timeout => ProbeError::timeout(&host.name),
        TransportError::Remote {
            code: EXIT_TOOL_MISSING,
            ..
        } => ProbeError::ToolMissing {
            host: name,
            tool: host.credentials.remote_command.clone(),
        },
        TransportError::Remote {
            code: EXIT_SOFT_FAILURE,
            stderr,
        } => ProbeError::SoftFailure {
            host: name,
            message: stderr,
        },
        TransportError::Remote {
            code: EXIT_NOT_FOUND,
            stderr,
        } => ProbeError::NotFound {
            host: name,
            vm: stderr,
        },
        TransportError::Remote { code, stderr } => ProbeError::Remote {
            host: name,
            message: format!("exit {code}: {stderr}"),
        },
    }
}

/// `classify` cannot know which VM a not-found refers to; fill it in.
fn not_found_as_vm(err: ProbeError, vm: &str) -> ProbeError {
    match err {
        ProbeError::NotFound { host, .. } => ProbeError::NotFound {
            host,
            vm: vm.to_string(),
        },
        other => other,
    }
}

// ── Inventory parsing ────────────────────────────────────

pub fn parse_inventory(host: &str, output: &str) -> Result<HostInventory, String> {
    let mut inventory = HostInventory::new(host);
    let mut order: Vec<String> = Vec::new();
    let mut vms: BTreeMap<String, ActualVm> = BTreeMap::new();

    for (lineno, line) in output.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let at = |msg: &str| format!("line {}: {msg}", lineno + 1);

        match fields.as_slice() {
            ["vm", name, power] => {
                if vms.contains_key(*name) {
                    return Err(at(&format!("VM '{name}' listed twice")));
                }
                let mut vm = ActualVm::new(*name, host);
                vm.power = PowerState::parse(power);
                order.push(name.to_string());
                vms.insert(name.to_string(), vm);
            }
            [kind @ ("attr" | "pending"), vm, key, value] => {
                let entry = vms
                    .get_mut(*vm)
                    .ok_or_else(|| at(&format!("{kind} for undeclared VM '{vm}'")))?;
                let Ok(key) = key.parse::<AttrKey>() else {
                    tracing::debug!(host, vm, key, "ignoring unknown attribute");
                    continue;
                };
                let target = if *kind == "attr" {
                    &mut entry.attributes
                } else {
                    &mut entry.pending
                };
                if !value.is_empty() {
                    target.insert(key, value.to_string());
                }
            }
            ["attached", vm, asset, checksum] => {
                let entry = vms
                    .get_mut(*vm)
                    .ok_or_else(|| at(&format!("attachment for undeclared VM '{vm}'")))?;
                entry.attached.push(AttachedAsset {
                    name: asset.to_string(),
                    checksum: match *checksum {
                        "" | "-" => None,
                        c => Some(c.to_string()),
                    },
                });
            }
            ["asset", name, checksum] => {
                inventory
                    .assets
                    .insert(name.to_string(), checksum.to_string());
            }
            _ => return Err(at(&format!("unrecognised record '{line}'"))),
        }
    }

    inventory.vms = order
        .into_iter()
        .filter_map(|name| vms.remove(&name))
        .collect();
    Ok(inventory)
}
