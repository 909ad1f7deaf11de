//! Actual state: what the hypervisors reported.
//!
//! A [`FleetMap`] is an immutable snapshot assembled from per-host
//! inventories. It is passed by reference through planning and execution;
//! nothing mutates it in place. Derived views (the name index and the
//! collision list) are recomputed whenever a new snapshot is assembled.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::error::FleetError;
use crate::model::{AttrKey, VmPath};

// ── Per-VM records ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Suspended,
    Unknown,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "on" | "poweredOn" => PowerState::On,
            "off" | "poweredOff" => PowerState::Off,
            "suspended" => PowerState::Suspended,
            _ => PowerState::Unknown,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A boot or disk asset attached to a VM, with the content checksum the
/// host computed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedAsset {
    pub name: String,
    pub checksum: Option<String>,
}

/// A VM as discovered on one hypervisor. Rebuilt on every probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualVm {
    pub name: String,
    pub host: String,
    pub power: PowerState,
    /// Live attribute values. Unset attributes are missing.
    pub attributes: BTreeMap<AttrKey, String>,
    /// Values staged for the next power-cycle.
    pub pending: BTreeMap<AttrKey, String>,
    pub attached: Vec<AttachedAsset>,
}

impl ActualVm {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            power: PowerState::Unknown,
            attributes: BTreeMap::new(),
            pending: BTreeMap::new(),
            attached: Vec::new(),
        }
    }

    /// The live value; `""` when unset.
    pub fn live(&self, key: AttrKey) -> &str {
        self.attributes.get(&key).map(String::as_str).unwrap_or("")
    }

    /// The value the VM will have after its next power-cycle.
    pub fn effective(&self, key: AttrKey) -> &str {
        self.pending
            .get(&key)
            .map(String::as_str)
            .unwrap_or_else(|| self.live(key))
    }

    /// The attached asset currently referenced as boot media.
    pub fn boot_asset(&self) -> Option<&AttachedAsset> {
        let name = self.attributes.get(&AttrKey::BootMedia)?;
        self.attached.iter().find(|a| &a.name == name)
    }
}

/// One hypervisor's probe result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostInventory {
    pub host: String,
    pub vms: Vec<ActualVm>,
    /// Assets present on the host's datastore: name → checksum.
    pub assets: BTreeMap<String, String>,
}

impl HostInventory {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn as_str(self) -> &'static str {
        match self {
            Reachability::Unknown => "unknown",
            Reachability::Reachable => "reachable",
            Reachability::Unreachable => "unreachable",
        }
    }
}

/// The same VM name reported by more than one hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub name: String,
    pub hosts: Vec<String>,
}

// ── FleetMap ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FleetMap {
    inventories: BTreeMap<String, HostInventory>,
    reachability: BTreeMap<String, Reachability>,
    /// Operator choices: VM name → authoritative host.
    resolved: BTreeMap<String, String>,
    partial: bool,
    captured_at: SystemTime,
    index: BTreeMap<String, String>,
    collisions: Vec<Collision>,
}

impl FleetMap {
    /// Assemble a snapshot. Hosts with an inventory are reachable; every
    /// host listed in `unreachable` is recorded as such.
    pub fn assemble(
        inventories: Vec<HostInventory>,
        unreachable: impl IntoIterator<Item = String>,
        partial: bool,
    ) -> Self {
        let mut reachability = BTreeMap::new();
        for host in unreachable {
            reachability.insert(host, Reachability::Unreachable);
        }
        let inventories: BTreeMap<String, HostInventory> = inventories
            .into_iter()
            .map(|inv| {
                reachability.insert(inv.host.clone(), Reachability::Reachable);
                (inv.host.clone(), inv)
            })
            .collect();

        let mut map = Self {
            inventories,
            reachability,
            resolved: BTreeMap::new(),
            partial,
            captured_at: SystemTime::now(),
            index: BTreeMap::new(),
            collisions: Vec::new(),
        };
        map.reindex();
        map
    }

    pub fn empty() -> Self {
        Self::assemble(Vec::new(), Vec::new(), false)
    }

    pub fn with_captured_at(mut self, at: SystemTime) -> Self {
        self.captured_at = at;
        self
    }

    fn reindex(&mut self) {
        let mut seen: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for inv in self.inventories.values() {
            for vm in &inv.vms {
                seen.entry(vm.name.as_str()).or_default().push(inv.host.as_str());
            }
        }

        let mut index = BTreeMap::new();
        let mut collisions = Vec::new();
        for (name, hosts) in seen {
            if hosts.len() == 1 {
                index.insert(name.to_string(), hosts[0].to_string());
                continue;
            }
            match self.resolved.get(name) {
                Some(chosen) if hosts.contains(&chosen.as_str()) => {
                    index.insert(name.to_string(), chosen.clone());
                }
                _ => collisions.push(Collision {
                    name: name.to_string(),
                    hosts: hosts.iter().map(|h| h.to_string()).collect(),
                }),
            }
        }

        self.index = index;
        self.collisions = collisions;
    }

    // ── Queries ──

    /// The authoritative instance of `name`. Collided names have none.
    pub fn get(&self, name: &str) -> Option<&ActualVm> {
        let host = self.index.get(name)?;
        self.find(host, name)
    }

    pub fn find(&self, host: &str, name: &str) -> Option<&ActualVm> {
        self.inventories
            .get(host)?
            .vms
            .iter()
            .find(|vm| vm.name == name)
    }

    /// Every instance of `name` across hosts.
    pub fn instances(&self, name: &str) -> Vec<&ActualVm> {
        self.vms().filter(|vm| vm.name == name).collect()
    }

    /// Non-authoritative instances left after a collision was resolved.
    pub fn strays(&self, name: &str) -> Vec<&ActualVm> {
        match self.index.get(name) {
            Some(host) => self
                .instances(name)
                .into_iter()
                .filter(|vm| &vm.host != host)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn collision(&self, name: &str) -> Option<&Collision> {
        self.collisions.iter().find(|c| c.name == name)
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    pub fn vms(&self) -> impl Iterator<Item = &ActualVm> {
        self.inventories.values().flat_map(|inv| inv.vms.iter())
    }

    pub fn inventories(&self) -> impl Iterator<Item = &HostInventory> {
        self.inventories.values()
    }

    pub fn inventory(&self, host: &str) -> Option<&HostInventory> {
        self.inventories.get(host)
    }

    pub fn reachability(&self, host: &str) -> Reachability {
        self.reachability
            .get(host)
            .copied()
            .unwrap_or(Reachability::Unknown)
    }

    pub fn unreachable_hosts(&self) -> impl Iterator<Item = &str> {
        self.reachability
            .iter()
            .filter(|(_, r)| **r == Reachability::Unreachable)
            .map(|(h, _)| h.as_str())
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.captured_at)
            .unwrap_or_default()
    }

    /// Whether `host` already holds `asset`. With a checksum, the content
    /// must match; without one, the name is enough.
    pub fn host_has_asset(&self, host: &str, asset: &str, checksum: Option<&str>) -> bool {
        let Some(present) = self.inventories.get(host).and_then(|inv| inv.assets.get(asset))
        else {
            return false;
        };
        checksum.is_none_or(|c| c == present)
    }

    /// Assets attached to `host/vm` that no other VM on the host uses.
    /// `keep` names an asset the VM goes on using.
    pub fn assets_released_by(&self, host: &str, vm: &str, keep: Option<&str>) -> Vec<String> {
        let Some(inv) = self.inventories.get(host) else {
            return Vec::new();
        };
        let Some(target) = inv.vms.iter().find(|v| v.name == vm) else {
            return Vec::new();
        };
        let in_use: BTreeSet<&str> = inv
            .vms
            .iter()
            .filter(|v| v.name != vm)
            .flat_map(|v| v.attached.iter().map(|a| a.name.as_str()))
            .collect();

        let mut released: Vec<String> = target
            .attached
            .iter()
            .map(|a| a.name.as_str())
            .filter(|name| !in_use.contains(name) && Some(*name) != keep)
            .map(String::from)
            .collect();
        released.sort();
        released.dedup();
        released
    }

    // ── Derivations ──

    /// Declare `host` authoritative for a collided `name`.
    pub fn resolve_collision(&self, name: &str, host: &str) -> Result<FleetMap, FleetError> {
        if self.find(host, name).is_none() {
            return Err(FleetError::UnknownVm {
                name: format!("{host}/{name}"),
            });
        }
        let mut next = self.clone();
        next.resolved.insert(name.to_string(), host.to_string());
        next.reindex();
        Ok(next)
    }

    /// Resolve each collided name in favour of the chosen `host/vm`.
    pub fn resolve_preferred(&self, prefer: &[VmPath]) -> Result<FleetMap, FleetError> {
        prefer.iter().try_fold(self.clone(), |map, choice| {
            tracing::debug!(%choice, "preferring instance");
            map.resolve_collision(&choice.vm, &choice.host)
        })
    }

    /// Replace the hosts covered by `fresh` with its data. The result is
    /// partial only if `self` was; its age is that of the oldest data kept.
    pub fn overlay(&self, fresh: FleetMap) -> FleetMap {
        let mut next = self.clone();
        for (host, reach) in fresh.reachability {
            next.reachability.insert(host.clone(), reach);
            if reach == Reachability::Unreachable {
                next.inventories.remove(&host);
            }
        }
        for (host, inv) in fresh.inventories {
            next.inventories.insert(host, inv);
        }
        next.captured_at = self.captured_at.min(fresh.captured_at);
        next.reindex();
        next
    }
}
