#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use esxctl::builder::{self, BuildOptions, BuildOutcome};
use esxctl::fleet::{ActualVm, AttachedAsset, FleetMap, HostInventory, PowerState};
use esxctl::model::{
    AttrKey, Attributes, Credentials, DesiredState, DesiredVm, HypervisorRecord, Setting,
};
use esxctl::probe::{ApplyAt, Control, Mutation, PowerOp, Probe, ProbeError};
use tokio_util::sync::CancellationToken;

/// An in-memory fleet. Mutations change what later probes report.
#[derive(Default)]
pub struct MemoryFleet {
    hosts: Mutex<BTreeMap<String, HostInventory>>,
    unreachable: BTreeSet<String>,
    delays: BTreeMap<String, Duration>,
    failing: BTreeSet<(String, String)>,
    local_sums: BTreeMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host holding `vms` (as `(name, [(key, value)])`).
    pub fn with_host(self, host: &str, vms: &[(&str, &[(AttrKey, &str)])]) -> Self {
        let mut inv = HostInventory::new(host);
        for (name, attrs) in vms {
            inv.vms.push(running(name, host, attrs));
        }
        self.with_inventory(inv)
    }

    pub fn with_inventory(self, inv: HostInventory) -> Self {
        self.hosts
            .lock()
            .unwrap()
            .insert(inv.host.clone(), inv);
        self
    }

    pub fn with_unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    pub fn with_delay(mut self, host: &str, delay: Duration) -> Self {
        self.delays.insert(host.to_string(), delay);
        self
    }

    /// Make `op` (`create`, `destroy`, `set`, `power`, `upload`,
    /// `remove-asset`) fail for `target` (a VM or asset name).
    pub fn failing(mut self, target: &str, op: &str) -> Self {
        self.failing.insert((target.to_string(), op.to_string()));
        self
    }

    /// Checksums that uploaded copies of local assets will carry.
    pub fn with_local_assets(mut self, sums: &BTreeMap<String, String>) -> Self {
        self.local_sums = sums.clone();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inventory(&self, host: &str) -> HostInventory {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_else(|| HostInventory::new(host))
    }

    fn record(&self, call: String, target: &str, op: &str, host: &str) -> Result<(), ProbeError> {
        self.calls.lock().unwrap().push(call);
        if self
            .failing
            .contains(&(target.to_string(), op.to_string()))
        {
            return Err(ProbeError::Remote {
                host: host.to_string(),
                message: format!("{op} {target}: injected failure"),
            });
        }
        Ok(())
    }

    fn with_vm<T>(
        &self,
        host: &str,
        vm: &str,
        f: impl FnOnce(&mut ActualVm, &BTreeMap<String, String>) -> T,
    ) -> Result<T, ProbeError> {
        let mut hosts = self.hosts.lock().unwrap();
        let inv = hosts.entry(host.to_string()).or_insert_with(|| HostInventory::new(host));
        let assets = inv.assets.clone();
        let found = inv
            .vms
            .iter_mut()
            .find(|v| v.name == vm)
            .ok_or_else(|| ProbeError::NotFound {
                host: host.to_string(),
                vm: vm.to_string(),
            })?;
        Ok(f(found, &assets))
    }
}

fn attach_boot(vm: &mut ActualVm, media: &str, assets: &BTreeMap<String, String>) {
    if let Some(old) = vm.attributes.get(&AttrKey::BootMedia).cloned() {
        vm.attached.retain(|a| a.name != old);
    }
    if !media.is_empty() {
        vm.attached.push(AttachedAsset {
            name: media.to_string(),
            checksum: assets.get(media).cloned(),
        });
    }
}

impl Probe for MemoryFleet {
    async fn inspect(&self, host: &HypervisorRecord) -> Result<HostInventory, ProbeError> {
        if let Some(delay) = self.delays.get(&host.name) {
            tokio::time::sleep(*delay).await;
        }
        if self.unreachable.contains(&host.name) {
            return Err(ProbeError::Unreachable {
                host: host.name.clone(),
                reason: "connection refused".into(),
                transient: false,
            });
        }
        Ok(self.inventory(&host.name))
    }
}

impl Control for MemoryFleet {
    async fn create_vm(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        attributes: &BTreeMap<AttrKey, String>,
    ) -> Result<Mutation, ProbeError> {
        self.record(format!("create {}/{vm}", host.name), vm, "create", &host.name)?;
        let mut hosts = self.hosts.lock().unwrap();
        let inv = hosts
            .entry(host.name.clone())
            .or_insert_with(|| HostInventory::new(&host.name));
        if inv.vms.iter().any(|v| v.name == vm) {
            return Err(ProbeError::Remote {
                host: host.name.clone(),
                message: format!("{vm} already exists"),
            });
        }
        let mut created = ActualVm::new(vm, &host.name);
        created.power = PowerState::Off;
        if let Some(media) = attributes.get(&AttrKey::BootMedia) {
            attach_boot(&mut created, media, &inv.assets);
        }
        created.attributes = attributes.clone();
        inv.vms.push(created);
        Ok(Mutation::Done)
    }

    async fn destroy_vm(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        _force: bool,
    ) -> Result<Mutation, ProbeError> {
        self.record(format!("destroy {}/{vm}", host.name), vm, "destroy", &host.name)?;
        let mut hosts = self.hosts.lock().unwrap();
        let Some(inv) = hosts.get_mut(&host.name) else {
            return Ok(Mutation::AlreadyAbsent);
        };
        let before = inv.vms.len();
        inv.vms.retain(|v| v.name != vm);
        Ok(if inv.vms.len() < before {
            Mutation::Done
        } else {
            Mutation::AlreadyAbsent
        })
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
        let forced = if force { " --force" } else { "" };
        self.record(
            format!("set {}/{vm} {key}={value} {}{forced}", host.name, at.as_str()),
            vm,
            "set",
            &host.name,
        )?;
        self.with_vm(&host.name, vm, |actual, assets| {
            match at {
                ApplyAt::NextBoot => {
                    actual.pending.insert(key, value.to_string());
                }
                ApplyAt::Live => {
                    if key == AttrKey::BootMedia {
                        attach_boot(actual, value, assets);
                    }
                    if value.is_empty() {
                        actual.attributes.remove(&key);
                    } else {
                        actual.attributes.insert(key, value.to_string());
                    }
                }
            }
            Mutation::Done
        })
    }

    async fn power(
        &self,
        host: &HypervisorRecord,
        vm: &str,
        op: PowerOp,
        _force: bool,
    ) -> Result<Mutation, ProbeError> {
        self.record(format!("power {}/{vm} {op}", host.name), vm, "power", &host.name)?;
        self.with_vm(&host.name, vm, |actual, _| {
            match op {
                PowerOp::On => actual.power = PowerState::On,
                PowerOp::Off => actual.power = PowerState::Off,
                PowerOp::Reboot => {
                    for (key, value) in std::mem::take(&mut actual.pending) {
                        if value.is_empty() {
                            actual.attributes.remove(&key);
                        } else {
                            actual.attributes.insert(key, value);
                        }
                    }
                    actual.power = PowerState::On;
                }
            }
            Mutation::Done
        })
    }

    async fn upload_asset(
        &self,
        host: &HypervisorRecord,
        asset: &str,
        _local: &Path,
    ) -> Result<Mutation, ProbeError> {
        self.record(format!("upload {}/{asset}", host.name), asset, "upload", &host.name)?;
        let sum = self
            .local_sums
            .get(asset)
            .cloned()
            .unwrap_or_else(|| format!("sum-{asset}"));
        self.hosts
            .lock()
            .unwrap()
            .entry(host.name.clone())
            .or_insert_with(|| HostInventory::new(&host.name))
            .assets
            .insert(asset.to_string(), sum);
        Ok(Mutation::Done)
    }

    async fn remove_asset(
        &self,
        host: &HypervisorRecord,
        asset: &str,
    ) -> Result<Mutation, ProbeError> {
        self.record(
            format!("remove-asset {}/{asset}", host.name),
            asset,
            "remove-asset",
            &host.name,
        )?;
        let mut hosts = self.hosts.lock().unwrap();
        let removed = hosts
            .get_mut(&host.name)
            .and_then(|inv| inv.assets.remove(asset));
        Ok(if removed.is_some() {
            Mutation::Done
        } else {
            Mutation::AlreadyAbsent
        })
    }
}

// ── Builders ─────────────────────────────────────────────

pub fn hypervisor(name: &str) -> HypervisorRecord {
    HypervisorRecord {
        name: name.into(),
        address: format!("{name}.lab"),
        credentials: Credentials {
            user: "root".into(),
            identity: None,
            remote_command: "vmctl-remote".into(),
        },
        defaults: Attributes::new(),
    }
}

pub fn running(name: &str, host: &str, attrs: &[(AttrKey, &str)]) -> ActualVm {
    let mut vm = ActualVm::new(name, host);
    vm.power = PowerState::On;
    for (key, value) in attrs {
        vm.attributes.insert(*key, value.to_string());
        if *key == AttrKey::BootMedia {
            vm.attached.push(AttachedAsset {
                name: value.to_string(),
                checksum: None,
            });
        }
    }
    vm
}

pub fn declared(name: &str, host: &str, attrs: &[(AttrKey, Setting)]) -> DesiredVm {
    let mut attributes = Attributes::new();
    for (key, setting) in attrs {
        attributes.set(*key, setting.clone());
    }
    DesiredVm {
        name: name.into(),
        host: host.into(),
        attributes,
    }
}

pub fn value(v: &str) -> Setting {
    Setting::Value(v.into())
}

pub fn desired(hosts: &[&str], vms: Vec<DesiredVm>) -> DesiredState {
    DesiredState {
        hypervisors: hosts.iter().map(|h| hypervisor(h)).collect(),
        vms,
        assets: BTreeMap::new(),
    }
}

pub fn quick_options() -> BuildOptions {
    BuildOptions {
        timeout: Duration::from_millis(200),
        retries: 0,
        backoff: Duration::from_millis(1),
        ..BuildOptions::default()
    }
}

/// Probe every hypervisor of `desired` through `fleet`.
pub async fn probe_all(fleet: &MemoryFleet, desired: &DesiredState) -> BuildOutcome {
    builder::build(
        fleet,
        &desired.hypervisors,
        &quick_options(),
        &(),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

pub fn fleet_map(fleet: &MemoryFleet, hosts: &[&str]) -> FleetMap {
    FleetMap::assemble(
        hosts.iter().map(|h| fleet.inventory(h)).collect(),
        Vec::new(),
        false,
    )
}
