//! Desired-versus-actual diff.
//!
//! [`diff`] is pure: it reads a [`DesiredState`] and a [`FleetMap`] and
//! returns the actions that would bring the fleet in line, plus warnings
//! for everything it refused to touch. Running it again against a map that
//! reflects the applied plan yields an empty plan.

pub mod actions;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::fleet::{ActualVm, FleetMap};
use crate::model::{ApplyClass, AttrKey, DesiredState, DesiredVm, Setting, VmPath};

pub use actions::{Action, ActionKind, ActionPlan, Policy};

/// Something the diff noticed but did not plan for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffWarning {
    /// The VM runs on another host than declared and relocation is off.
    Stray {
        vm: String,
        declared_host: String,
        found_on: Vec<String>,
    },
    /// Relocation needs the whole fleet in view.
    PartialMap { vm: String },
    /// Several hosts report this name; nothing is done until resolved.
    Collision { vm: String, hosts: Vec<String> },
    /// The host is unreachable or could not be probed.
    HostUnavailable { vm: String, host: String },
    /// Boot media is neither in the local asset catalog nor on the host.
    MissingAsset {
        vm: String,
        host: String,
        asset: String,
    },
    /// A destroy target that does not exist.
    UnknownTarget { target: VmPath },
    /// A destroy target the configuration still declares on that host.
    StillDeclared { target: VmPath },
}

impl fmt::Display for DiffWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffWarning::Stray {
                vm,
                declared_host,
                found_on,
            } => write!(
                f,
                "{vm} is declared on {declared_host} but runs on {}; pass --relocate to move it",
                found_on.join(", ")
            ),
            DiffWarning::PartialMap { vm } => {
                write!(f, "{vm}: relocation needs a full fleet map, not moving it")
            }
            DiffWarning::Collision { vm, hosts } => write!(
                f,
                "{vm} exists on {}; pass --prefer HOST/{vm} or destroy the unwanted instance",
                hosts.join(" and ")
            ),
            DiffWarning::HostUnavailable { vm, host } => {
                write!(f, "{vm}: host {host} is unavailable, skipped")
            }
            DiffWarning::MissingAsset { vm, host, asset } => write!(
                f,
                "{vm}: asset '{asset}' is not in the asset directory nor on {host}"
            ),
            DiffWarning::UnknownTarget { target } => write!(f, "{target} does not exist"),
            DiffWarning::StillDeclared { target } => write!(
                f,
                "{target} is still declared in the configuration, not destroying"
            ),
        }
    }
}

/// What to diff and under which policy.
#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    pub policy: Policy,
    /// Explicit `host/vm` destroy targets.
    pub destroy_targets: Vec<VmPath>,
    /// Restrict reconciliation to these declared VMs.
    pub only: Option<BTreeSet<String>>,
}

impl DiffRequest {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    fn wants(&self, vm: &str) -> bool {
        self.only.as_ref().is_none_or(|only| only.contains(vm))
    }
}

/// Actions grouped by ordering phase; concatenated in this order.
#[derive(Default)]
struct Phases {
    relocations: Vec<Action>,
    destroys: Vec<Action>,
    creates: Vec<Action>,
    updates: Vec<Action>,
}

/// Attributes whose values name an asset on the host.
const ASSET_KEYS: [AttrKey; 2] = [AttrKey::BootMedia, AttrKey::Disk];

impl Phases {
    /// Assets each host must keep: those any declared VM names, plus those
    /// named by a planned create or update.
    fn assets_in_use(&self, desired: &DesiredState) -> BTreeMap<String, BTreeSet<String>> {
        let mut in_use: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for vm in &desired.vms {
            for key in ASSET_KEYS {
                if let Some(asset) = vm.attributes.get(key).value() {
                    in_use
                        .entry(vm.host.clone())
                        .or_default()
                        .insert(asset.to_string());
                }
            }
        }
        for action in self.creates.iter().chain(&self.updates) {
            let named: Vec<&str> = match &action.kind {
                ActionKind::Create { attributes, upload } => ASSET_KEYS
                    .iter()
                    .filter_map(|key| attributes.get(key).map(String::as_str))
                    .chain(upload.as_deref())
                    .collect(),
                ActionKind::UpdateAttr { key, value, upload } if ASSET_KEYS.contains(key) => {
                    std::iter::once(value.as_str()).chain(upload.as_deref()).collect()
                }
                _ => continue,
            };
            in_use.entry(action.host.clone()).or_default().extend(
                named
                    .into_iter()
                    .filter(|a| !a.is_empty())
                    .map(String::from),
            );
        }
        in_use
    }

    /// Strip still-referenced assets from every cleanup. A cleanup left
    /// with nothing to remove is dropped.
    fn spare_assets_in_use(&mut self, desired: &DesiredState) {
        let in_use = self.assets_in_use(desired);
        for actions in [&mut self.relocations, &mut self.destroys, &mut self.updates] {
            actions.retain_mut(|action| {
                let ActionKind::CleanupAssets { assets } = &mut action.kind else {
                    return true;
                };
                let Some(keep) = in_use.get(&action.host) else {
                    return true;
                };
                let before = assets.len();
                assets.retain(|a| !keep.contains(a));
                if assets.len() == before {
                    return true;
                }
                tracing::debug!(host = %action.host, vm = %action.vm, "asset still in use, not removing");
                !assets.is_empty()
            });
        }
    }

    fn into_plan(self) -> ActionPlan {
        let mut actions = self.relocations;
        actions.extend(self.destroys);
        actions.extend(self.creates);
        actions.extend(self.updates);
        ActionPlan::new(actions)
    }
}

pub fn diff(
    desired: &DesiredState,
    actual: &FleetMap,
    request: &DiffRequest,
) -> (ActionPlan, Vec<DiffWarning>) {
    let mut phases = Phases::default();
    let mut warnings = Vec::new();

    for vm in desired.vms.iter().filter(|vm| request.wants(&vm.name)) {
        diff_vm(desired, vm, actual, request.policy, &mut phases, &mut warnings);
    }
    for target in &request.destroy_targets {
        diff_destroy(desired, target, actual, request.policy, &mut phases, &mut warnings);
    }
    phases.spare_assets_in_use(desired);

    for warning in &warnings {
        tracing::debug!(%warning, "diff warning");
    }
    (phases.into_plan(), warnings)
}

fn diff_vm(
    desired: &DesiredState,
    vm: &DesiredVm,
    actual: &FleetMap,
    policy: Policy,
    phases: &mut Phases,
    warnings: &mut Vec<DiffWarning>,
) {
    let host = vm.host.as_str();

    if let Some(collision) = actual.collision(&vm.name) {
        warnings.push(DiffWarning::Collision {
            vm: vm.name.clone(),
            hosts: collision.hosts.clone(),
        });
        return;
    }
    if actual.inventory(host).is_none() {
        warnings.push(DiffWarning::HostUnavailable {
            vm: vm.name.clone(),
            host: host.to_string(),
        });
        return;
    }

    let on_declared = actual.find(host, &vm.name);
    let strays: Vec<&ActualVm> = actual
        .instances(&vm.name)
        .into_iter()
        .filter(|found| found.host != host)
        .collect();

    if let Some(current) = on_declared {
        if !strays.is_empty() && !policy.relocate {
            warnings.push(stray_warning(vm, &strays));
        } else if !strays.is_empty() && actual.is_partial() {
            warnings.push(DiffWarning::PartialMap {
                vm: vm.name.clone(),
            });
        } else {
            plan_relocation(vm, &strays, actual, policy, phases);
        }
        diff_attributes(desired, vm, current, actual, policy, phases, warnings);
        return;
    }

    if !strays.is_empty() {
        if !policy.relocate {
            warnings.push(stray_warning(vm, &strays));
            return;
        }
        if actual.is_partial() {
            warnings.push(DiffWarning::PartialMap {
                vm: vm.name.clone(),
            });
            return;
        }
    }

    let upload = match boot_upload(desired, vm, actual, warnings) {
        Ok(upload) => upload,
        Err(()) => return,
    };
    plan_relocation(vm, &strays, actual, policy, phases);
    phases.creates.push(Action::new(
        &vm.name,
        host,
        ActionKind::Create {
            attributes: vm.attributes.values(),
            upload,
        },
        policy,
    ));
}

fn stray_warning(vm: &DesiredVm, strays: &[&ActualVm]) -> DiffWarning {
    DiffWarning::Stray {
        vm: vm.name.clone(),
        declared_host: vm.host.clone(),
        found_on: strays.iter().map(|s| s.host.clone()).collect(),
    }
}

fn plan_relocation(
    vm: &DesiredVm,
    strays: &[&ActualVm],
    actual: &FleetMap,
    policy: Policy,
    phases: &mut Phases,
) {
    for stray in strays {
        phases.relocations.push(Action::new(
            &vm.name,
            &stray.host,
            ActionKind::MigrateDestroyOther {
                declared_host: vm.host.clone(),
            },
            policy,
        ));
        if !policy.skip_removal {
            let assets = actual.assets_released_by(&stray.host, &vm.name, None);
            if !assets.is_empty() {
                phases.relocations.push(Action::new(
                    &vm.name,
                    &stray.host,
                    ActionKind::CleanupAssets { assets },
                    policy,
                ));
            }
        }
    }
}

/// The asset to upload for `vm`'s boot media on its declared host, if any.
/// `Err` means the media is nowhere to be found and a warning was pushed.
fn boot_upload(
    desired: &DesiredState,
    vm: &DesiredVm,
    actual: &FleetMap,
    warnings: &mut Vec<DiffWarning>,
) -> Result<Option<String>, ()> {
    let Some(asset) = vm.boot_media().value() else {
        return Ok(None);
    };
    match desired.asset_checksum(asset) {
        Some(sum) if actual.host_has_asset(&vm.host, asset, Some(sum)) => Ok(None),
        Some(_) => Ok(Some(asset.to_string())),
        None if actual.host_has_asset(&vm.host, asset, None) => Ok(None),
        None => {
            warnings.push(DiffWarning::MissingAsset {
                vm: vm.name.clone(),
                host: vm.host.clone(),
                asset: asset.to_string(),
            });
            Err(())
        }
    }
}

fn diff_attributes(
    desired: &DesiredState,
    vm: &DesiredVm,
    current: &ActualVm,
    actual: &FleetMap,
    policy: Policy,
    phases: &mut Phases,
    warnings: &mut Vec<DiffWarning>,
) {
    for (key, setting) in vm.attributes.iter() {
        let Some(target) = setting.target() else {
            continue;
        };

        if key == AttrKey::BootMedia {
            if boot_media_matches(desired, setting, current, policy) {
                continue;
            }
            let Ok(upload) = boot_upload(desired, vm, actual, warnings) else {
                continue;
            };
            phases.updates.push(Action::new(
                &vm.name,
                &vm.host,
                ActionKind::UpdateAttr {
                    key,
                    value: target.to_string(),
                    upload,
                },
                policy,
            ));
            plan_media_cleanup(vm, current, target, actual, policy, phases);
            continue;
        }

        let kind = match key.apply_class() {
            ApplyClass::Live if current.live(key) != target => ActionKind::UpdateAttr {
                key,
                value: target.to_string(),
                upload: None,
            },
            ApplyClass::RebootRequired if current.effective(key) != target => {
                ActionKind::DeferUpdateAttr {
                    key,
                    value: target.to_string(),
                }
            }
            _ => continue,
        };
        phases
            .updates
            .push(Action::new(&vm.name, &vm.host, kind, policy));
    }
}

/// Same content by checksum when both sides know it; otherwise (or when
/// checksums are not trusted to be verified) the same reference name.
fn boot_media_matches(
    desired: &DesiredState,
    setting: &Setting,
    current: &ActualVm,
    policy: Policy,
) -> bool {
    let live = current.live(AttrKey::BootMedia);
    let Some(wanted) = setting.value() else {
        return live.is_empty();
    };
    if !policy.trust {
        let desired_sum = desired.asset_checksum(wanted);
        let actual_sum = current.boot_asset().and_then(|a| a.checksum.as_deref());
        if let (Some(d), Some(a)) = (desired_sum, actual_sum) {
            return d == a;
        }
    }
    live == wanted
}

/// After swapping boot media, the old image may be unused on the host.
fn plan_media_cleanup(
    vm: &DesiredVm,
    current: &ActualVm,
    new_media: &str,
    actual: &FleetMap,
    policy: Policy,
    phases: &mut Phases,
) {
    let old = current.live(AttrKey::BootMedia);
    if policy.skip_removal || old.is_empty() || old == new_media {
        return;
    }
    let released = actual.assets_released_by(&vm.host, &vm.name, Some(new_media));
    if released.iter().any(|a| a == old) {
        phases.updates.push(Action::new(
            &vm.name,
            &vm.host,
            ActionKind::CleanupAssets {
                assets: vec![old.to_string()],
            },
            policy,
        ));
    }
}

fn diff_destroy(
    desired: &DesiredState,
    target: &VmPath,
    actual: &FleetMap,
    policy: Policy,
    phases: &mut Phases,
    warnings: &mut Vec<DiffWarning>,
) {
    if actual.inventory(&target.host).is_none() {
        warnings.push(DiffWarning::HostUnavailable {
            vm: target.vm.clone(),
            host: target.host.clone(),
        });
        return;
    }
    if actual.find(&target.host, &target.vm).is_none() {
        warnings.push(DiffWarning::UnknownTarget {
            target: target.clone(),
        });
        return;
    }
    if desired
        .vm(&target.vm)
        .is_some_and(|vm| vm.host == target.host)
    {
        warnings.push(DiffWarning::StillDeclared {
            target: target.clone(),
        });
        return;
    }

    phases.destroys.push(Action::new(
        &target.vm,
        &target.host,
        ActionKind::Destroy,
        policy,
    ));
    if !policy.skip_removal {
        phases.destroys.push(Action::new(
            &target.vm,
            &target.host,
            ActionKind::CleanupAssets {
                assets: actual.assets_released_by(&target.host, &target.vm, None),
            },
            policy,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fleet::{AttachedAsset, HostInventory};
    use crate::model::{Attributes, Credentials, HypervisorRecord};

    fn hypervisor(name: &str) -> HypervisorRecord {
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

    fn declared(name: &str, host: &str, attrs: &[(AttrKey, Setting)]) -> DesiredVm {
        let mut attributes = Attributes::new();
        for (k, v) in attrs {
            attributes.set(*k, v.clone());
        }
        DesiredVm {
            name: name.into(),
            host: host.into(),
            attributes,
        }
    }

    fn value(v: &str) -> Setting {
        Setting::Value(v.into())
    }

    fn state(vms: Vec<DesiredVm>) -> DesiredState {
        DesiredState {
            hypervisors: vec![hypervisor("esx1"), hypervisor("esx2")],
            vms,
            assets: Default::default(),
        }
    }

    fn running(name: &str, host: &str, attrs: &[(AttrKey, &str)]) -> ActualVm {
        let mut vm = ActualVm::new(name, host);
        for (k, v) in attrs {
            vm.attributes.insert(*k, v.to_string());
        }
        vm
    }

    fn fleet(vms: Vec<ActualVm>) -> FleetMap {
        let mut esx1 = HostInventory::new("esx1");
        let mut esx2 = HostInventory::new("esx2");
        for vm in vms {
            if vm.host == "esx1" {
                esx1.vms.push(vm);
            } else {
                esx2.vms.push(vm);
            }
        }
        FleetMap::assemble(vec![esx1, esx2], Vec::new(), false)
    }

    #[test]
    fn live_and_reboot_attributes_split() {
        let desired = state(vec![declared(
            "web",
            "esx1",
            &[(AttrKey::Network, value("DMZ")), (AttrKey::Memory, value("4096"))],
        )]);
        let actual = fleet(vec![running(
            "web",
            "esx1",
            &[(AttrKey::Network, "VM Network"), (AttrKey::Memory, "2048")],
        )]);
        let (plan, warnings) = diff(&desired, &actual, &DiffRequest::default());
        assert!(warnings.is_empty());
        let labels: Vec<_> = plan.iter().map(|a| a.kind.label()).collect();
        assert_eq!(labels, vec!["defer-update-attr", "update-attr"]);
    }

    #[test]
    fn pending_value_counts_as_applied() {
        let desired = state(vec![declared("web", "esx1", &[(AttrKey::Memory, value("4096"))])]);
        let mut vm = running("web", "esx1", &[(AttrKey::Memory, "2048")]);
        vm.pending.insert(AttrKey::Memory, "4096".into());
        let (plan, _) = diff(&desired, &fleet(vec![vm]), &DiffRequest::default());
        assert!(plan.is_empty());
    }

    #[test]
    fn boot_media_same_checksum_different_name_is_unchanged() {
        let mut desired = state(vec![declared(
            "web",
            "esx1",
            &[(AttrKey::BootMedia, value("installer-v2.iso"))],
        )]);
        desired.assets.insert("installer-v2.iso".into(), "sum-a".into());
        let mut vm = running("web", "esx1", &[(AttrKey::BootMedia, "installer.iso")]);
        vm.attached.push(AttachedAsset {
            name: "installer.iso".into(),
            checksum: Some("sum-a".into()),
        });
        let actual = fleet(vec![vm]);

        let (plan, _) = diff(&desired, &actual, &DiffRequest::default());
        assert!(plan.is_empty());

        // With checksum verification skipped, the names decide.
        let trusting = DiffRequest::new(Policy {
            trust: true,
            ..Policy::default()
        });
        let (plan, _) = diff(&desired, &actual, &trusting);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.actions()[0].kind.label(), "update-attr");
        assert_eq!(
            plan.actions()[1].kind,
            ActionKind::CleanupAssets {
                assets: vec!["installer.iso".into()]
            }
        );
    }

    #[test]
    fn boot_media_changed_content_uploads() {
        let mut desired = state(vec![declared("web", "esx1", &[(AttrKey::BootMedia, value("boot.iso"))])]);
        desired.assets.insert("boot.iso".into(), "new".into());
        let mut vm = running("web", "esx1", &[(AttrKey::BootMedia, "boot.iso")]);
        vm.attached.push(AttachedAsset {
            name: "boot.iso".into(),
            checksum: Some("old".into()),
        });
        let (plan, _) = diff(&desired, &fleet(vec![vm]), &DiffRequest::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.actions()[0].kind,
            ActionKind::UpdateAttr {
                key: AttrKey::BootMedia,
                value: "boot.iso".into(),
                upload: Some("boot.iso".into()),
            }
        );
    }

    #[test]
    fn missing_boot_asset_withholds_create() {
        let desired = state(vec![declared("web", "esx1", &[(AttrKey::BootMedia, value("nowhere.iso"))])]);
        let (plan, warnings) = diff(&desired, &fleet(vec![]), &DiffRequest::default());
        assert!(plan.is_empty());
        assert!(matches!(warnings[0], DiffWarning::MissingAsset { .. }));
    }

    #[test]
    fn only_restricts_to_named_vms() {
        let desired = state(vec![declared("a", "esx1", &[]), declared("b", "esx1", &[])]);
        let request = DiffRequest {
            only: Some(["b".to_string()].into()),
            ..DiffRequest::default()
        };
        let (plan, _) = diff(&desired, &fleet(vec![]), &request);
        assert_eq!(plan.vms(), vec!["b"]);
    }

    #[test]
    fn destroying_a_declared_vm_is_refused() {
        let desired = state(vec![declared("a", "esx1", &[])]);
        let request = DiffRequest {
            destroy_targets: vec!["esx1/a".parse().unwrap()],
            ..DiffRequest::default()
        };
        let (plan, warnings) = diff(&desired, &fleet(vec![running("a", "esx1", &[])]), &request);
        assert!(plan.is_empty());
        assert!(matches!(warnings[0], DiffWarning::StillDeclared { .. }));
    }

    #[test]
    fn skip_removal_drops_cleanup() {
        let request = DiffRequest {
            policy: Policy {
                skip_removal: true,
                ..Policy::default()
            },
            destroy_targets: vec!["esx2/vmC".parse().unwrap()],
            only: None,
        };
        let (plan, _) = diff(&state(vec![]), &fleet(vec![running("vmC", "esx2", &[])]), &request);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions()[0].kind, ActionKind::Destroy);
    }
}
